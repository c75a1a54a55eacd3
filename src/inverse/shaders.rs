//! WGSL source for the device batched inversion.
//!
//! Complex values are `vec2<f32>` (`.x` real, `.y` imaginary), matrices are
//! row-major and packed back to back.

/// WGSL source with a single entry point, `batch_invert`.
///
/// One invocation inverts one matrix by Gauss-Jordan elimination with
/// partial pivoting. `work` holds the input and is destroyed; `inv` must
/// hold identity matrices on entry and holds the inverses on exit.
pub const SHADER_SOURCE: &str = r#"
struct Params {
    n: u32,
    batch: u32,
    _pad0: u32,
    _pad1: u32,
}

@group(0) @binding(0) var<storage, read_write> work: array<vec2<f32>>;
@group(0) @binding(1) var<storage, read_write> inv: array<vec2<f32>>;
@group(0) @binding(2) var<uniform> params: Params;

fn cmul(a: vec2<f32>, b: vec2<f32>) -> vec2<f32> {
    return vec2<f32>(a.x * b.x - a.y * b.y, a.x * b.y + a.y * b.x);
}

fn cdiv(a: vec2<f32>, b: vec2<f32>) -> vec2<f32> {
    let d = b.x * b.x + b.y * b.y;
    return vec2<f32>(a.x * b.x + a.y * b.y, a.y * b.x - a.x * b.y) / d;
}

@compute @workgroup_size(64)
fn batch_invert(@builtin(global_invocation_id) gid: vec3<u32>) {
    let m = gid.x;
    if m >= params.batch {
        return;
    }
    let n = params.n;
    let base = m * n * n;

    for (var k = 0u; k < n; k = k + 1u) {
        var p = k;
        var best = length(work[base + k * n + k]);
        for (var i = k + 1u; i < n; i = i + 1u) {
            let v = length(work[base + i * n + k]);
            if v > best {
                best = v;
                p = i;
            }
        }
        if p != k {
            for (var j = 0u; j < n; j = j + 1u) {
                let w = work[base + k * n + j];
                work[base + k * n + j] = work[base + p * n + j];
                work[base + p * n + j] = w;
                let s = inv[base + k * n + j];
                inv[base + k * n + j] = inv[base + p * n + j];
                inv[base + p * n + j] = s;
            }
        }

        let pivot = work[base + k * n + k];
        for (var j = 0u; j < n; j = j + 1u) {
            work[base + k * n + j] = cdiv(work[base + k * n + j], pivot);
            inv[base + k * n + j] = cdiv(inv[base + k * n + j], pivot);
        }

        for (var i = 0u; i < n; i = i + 1u) {
            if i == k {
                continue;
            }
            let f = work[base + i * n + k];
            for (var j = 0u; j < n; j = j + 1u) {
                work[base + i * n + j] = work[base + i * n + j] - cmul(f, work[base + k * n + j]);
                inv[base + i * n + j] = inv[base + i * n + j] - cmul(f, inv[base + k * n + j]);
            }
        }
    }
}
"#;
