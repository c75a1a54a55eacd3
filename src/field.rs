//! Lattice field handles.
//!
//! A `ColorSpinorField` is a vector of complex numbers tagged with its
//! lattice layout, storage precision and memory location. Solvers treat it
//! as opaque; the fused kernels in `crate::blas` reach its storage through
//! block views.
//!
//! Half precision is stored as 16-bit fixed point with one `f32` norm per
//! lattice site (the largest real component of that site), so small
//! residuals keep their relative accuracy instead of underflowing.

use num_complex::Complex64;

use crate::error::{Result, SolverError};

/// Largest magnitude of a half-precision fixed-point component.
pub(crate) const HALF_MAX: f64 = 32767.0;

/// Storage precision of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Precision {
    /// 16-bit fixed point with a per-site `f32` norm.
    Half,
    /// IEEE `f32`.
    Single,
    /// IEEE `f64`.
    Double,
}

impl Precision {
    /// Bytes per real component.
    pub fn bytes(self) -> usize {
        match self {
            Precision::Half => 2,
            Precision::Single => 4,
            Precision::Double => 8,
        }
    }
}

/// Where the field data lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    /// Resident with the parallel kernel engine.
    Device,
    /// Host staging copy; the fused kernels refuse these.
    Host,
}

/// Degrees of freedom of a field: lattice sites times spin times colour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldLayout {
    pub volume: usize,
    pub n_spin: usize,
    pub n_color: usize,
}

impl FieldLayout {
    pub fn new(volume: usize, n_spin: usize, n_color: usize) -> Self {
        Self {
            volume,
            n_spin,
            n_color,
        }
    }

    /// Complex elements per lattice site.
    pub fn site_length(&self) -> usize {
        self.n_spin * self.n_color
    }

    /// Complex elements in the whole field.
    pub fn length(&self) -> usize {
        self.volume * self.site_length()
    }

    /// Real components in the whole field.
    pub fn real_length(&self) -> usize {
        2 * self.length()
    }
}

/// Fill policy for newly created fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FieldCreate {
    #[default]
    Zero,
    /// Contents are unspecified; the caller writes before reading. Storage
    /// is filled with NaN so that a read before the first write shows up
    /// in every result it reaches.
    Null,
}

/// Parameters for creating a field.
#[derive(Debug, Clone)]
pub struct FieldParam {
    pub layout: FieldLayout,
    pub precision: Precision,
    pub location: Location,
    pub create: FieldCreate,
}

impl FieldParam {
    pub fn new(layout: FieldLayout, precision: Precision, location: Location) -> Self {
        Self {
            layout,
            precision,
            location,
            create: FieldCreate::Zero,
        }
    }

    /// Parameters describing a field shaped like `field`.
    pub fn like(field: &ColorSpinorField) -> Self {
        Self::new(field.layout, field.precision, field.location)
    }

    pub fn with_precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }

    pub fn with_location(mut self, location: Location) -> Self {
        self.location = location;
        self
    }

    pub fn with_create(mut self, create: FieldCreate) -> Self {
        self.create = create;
        self
    }
}

#[derive(Debug, Clone)]
pub(crate) enum FieldData {
    Half {
        values: Vec<i16>,
        norms: Vec<f32>,
        site_len: usize,
    },
    Single(Vec<f32>),
    Double(Vec<f64>),
}

impl FieldData {
    fn alloc(precision: Precision, layout: &FieldLayout, create: FieldCreate) -> Self {
        let n_real = layout.real_length();
        let fill = match create {
            FieldCreate::Zero => 0.0,
            FieldCreate::Null => f64::NAN,
        };
        match precision {
            // A NaN site norm poisons the whole site on load.
            Precision::Half => FieldData::Half {
                values: vec![0; n_real],
                norms: vec![fill as f32; layout.volume],
                site_len: layout.site_length(),
            },
            Precision::Single => FieldData::Single(vec![fill as f32; n_real]),
            Precision::Double => FieldData::Double(vec![fill; n_real]),
        }
    }

    pub(crate) fn view(&self) -> FieldView<'_> {
        match self {
            FieldData::Half {
                values,
                norms,
                site_len,
            } => FieldView::Half {
                values,
                norms,
                site_len: *site_len,
            },
            FieldData::Single(s) => FieldView::Single(s),
            FieldData::Double(s) => FieldView::Double(s),
        }
    }

    pub(crate) fn view_mut(&mut self) -> FieldViewMut<'_> {
        match self {
            FieldData::Half {
                values,
                norms,
                site_len,
            } => FieldViewMut::Half {
                values,
                norms,
                site_len: *site_len,
            },
            FieldData::Single(s) => FieldViewMut::Single(s),
            FieldData::Double(s) => FieldViewMut::Double(s),
        }
    }
}

/// Read-only view of a contiguous range of a field.
#[derive(Debug, Clone, Copy)]
pub(crate) enum FieldView<'a> {
    Half {
        values: &'a [i16],
        norms: &'a [f32],
        site_len: usize,
    },
    Single(&'a [f32]),
    Double(&'a [f64]),
}

impl<'a> FieldView<'a> {
    /// Complex elements covered by the view.
    pub(crate) fn len(&self) -> usize {
        match self {
            FieldView::Half { values, .. } => values.len() / 2,
            FieldView::Single(s) => s.len() / 2,
            FieldView::Double(s) => s.len() / 2,
        }
    }

    pub(crate) fn load(&self, i: usize) -> Complex64 {
        match *self {
            FieldView::Half {
                values,
                norms,
                site_len,
            } => {
                let scale = norms[i / site_len] as f64 / HALF_MAX;
                Complex64::new(values[2 * i] as f64 * scale, values[2 * i + 1] as f64 * scale)
            }
            FieldView::Single(s) => Complex64::new(s[2 * i] as f64, s[2 * i + 1] as f64),
            FieldView::Double(s) => Complex64::new(s[2 * i], s[2 * i + 1]),
        }
    }

    /// Split into consecutive blocks of `block_len` complex elements.
    ///
    /// For half precision `block_len` must be a multiple of the site length.
    pub(crate) fn blocks(self, block_len: usize) -> Vec<FieldView<'a>> {
        match self {
            // Sites without elements: nothing to split.
            FieldView::Half { site_len: 0, .. } => Vec::new(),
            FieldView::Half {
                values,
                norms,
                site_len,
            } => values
                .chunks(2 * block_len)
                .zip(norms.chunks(block_len / site_len))
                .map(|(values, norms)| FieldView::Half {
                    values,
                    norms,
                    site_len,
                })
                .collect(),
            FieldView::Single(s) => s.chunks(2 * block_len).map(FieldView::Single).collect(),
            FieldView::Double(s) => s.chunks(2 * block_len).map(FieldView::Double).collect(),
        }
    }
}

/// Mutable view of a contiguous range of a field.
#[derive(Debug)]
pub(crate) enum FieldViewMut<'a> {
    Half {
        values: &'a mut [i16],
        norms: &'a mut [f32],
        site_len: usize,
    },
    Single(&'a mut [f32]),
    Double(&'a mut [f64]),
}

impl<'a> FieldViewMut<'a> {
    pub(crate) fn len(&self) -> usize {
        match self {
            FieldViewMut::Half { values, .. } => values.len() / 2,
            FieldViewMut::Single(s) => s.len() / 2,
            FieldViewMut::Double(s) => s.len() / 2,
        }
    }

    pub(crate) fn load(&self, i: usize) -> Complex64 {
        match self {
            FieldViewMut::Half {
                values,
                norms,
                site_len,
            } => FieldView::Half {
                values,
                norms,
                site_len: *site_len,
            }
            .load(i),
            FieldViewMut::Single(s) => FieldView::Single(s).load(i),
            FieldViewMut::Double(s) => FieldView::Double(s).load(i),
        }
    }

    /// Store `vals` starting at complex element `start`.
    ///
    /// Half precision recomputes the site norms, so `start` and `vals.len()`
    /// must cover whole sites.
    pub(crate) fn store(&mut self, start: usize, vals: &[Complex64]) {
        match self {
            FieldViewMut::Half {
                values,
                norms,
                site_len,
            } => {
                let site_len = *site_len;
                if site_len == 0 {
                    return;
                }
                for (s, site) in vals.chunks(site_len).enumerate() {
                    let norm = site_norm(site) as f32;
                    norms[start / site_len + s] = norm;
                    let scale = if norm > 0.0 {
                        HALF_MAX / norm as f64
                    } else {
                        0.0
                    };
                    let base = start + s * site_len;
                    for (j, z) in site.iter().enumerate() {
                        values[2 * (base + j)] = quantize(z.re * scale);
                        values[2 * (base + j) + 1] = quantize(z.im * scale);
                    }
                }
            }
            FieldViewMut::Single(s) => {
                for (j, z) in vals.iter().enumerate() {
                    s[2 * (start + j)] = z.re as f32;
                    s[2 * (start + j) + 1] = z.im as f32;
                }
            }
            FieldViewMut::Double(s) => {
                for (j, z) in vals.iter().enumerate() {
                    s[2 * (start + j)] = z.re;
                    s[2 * (start + j) + 1] = z.im;
                }
            }
        }
    }

    pub(crate) fn blocks(self, block_len: usize) -> Vec<FieldViewMut<'a>> {
        match self {
            FieldViewMut::Half { site_len: 0, .. } => Vec::new(),
            FieldViewMut::Half {
                values,
                norms,
                site_len,
            } => values
                .chunks_mut(2 * block_len)
                .zip(norms.chunks_mut(block_len / site_len))
                .map(|(values, norms)| FieldViewMut::Half {
                    values,
                    norms,
                    site_len,
                })
                .collect(),
            FieldViewMut::Single(s) => s
                .chunks_mut(2 * block_len)
                .map(FieldViewMut::Single)
                .collect(),
            FieldViewMut::Double(s) => s
                .chunks_mut(2 * block_len)
                .map(FieldViewMut::Double)
                .collect(),
        }
    }
}

/// Largest real component of a site; NaN and infinity win so that
/// non-finite values survive quantisation.
fn site_norm(site: &[Complex64]) -> f64 {
    let mut max = 0.0f64;
    for z in site {
        let m = z.re.abs().max(z.im.abs());
        if m.is_nan() || z.re.is_nan() || z.im.is_nan() {
            return f64::NAN;
        }
        if m > max {
            max = m;
        }
    }
    max
}

fn quantize(v: f64) -> i16 {
    v.round().clamp(-HALF_MAX, HALF_MAX) as i16
}

/// A precision-tagged, layout-tagged lattice vector.
#[derive(Debug, Clone)]
pub struct ColorSpinorField {
    layout: FieldLayout,
    precision: Precision,
    location: Location,
    data: FieldData,
}

impl ColorSpinorField {
    /// Allocate a field filled according to `param.create`.
    pub fn new(param: &FieldParam) -> Self {
        Self {
            layout: param.layout,
            precision: param.precision,
            location: param.location,
            data: FieldData::alloc(param.precision, &param.layout, param.create),
        }
    }

    /// Build a field from complex values, rounding to `precision`.
    pub fn from_complex(
        layout: FieldLayout,
        precision: Precision,
        location: Location,
        values: &[Complex64],
    ) -> Result<Self> {
        let mut field = Self::new(&FieldParam::new(layout, precision, location));
        field.assign_complex(values)?;
        Ok(field)
    }

    /// Overwrite the contents with `values`, rounding to the field precision.
    pub fn assign_complex(&mut self, values: &[Complex64]) -> Result<()> {
        if self.precision == Precision::Half && self.layout.site_length() == 0 {
            return Err(SolverError::Shape(format!(
                "half-precision field needs at least one element per site, layout is {:?}",
                self.layout
            )));
        }
        if values.len() != self.length() {
            return Err(SolverError::Shape(format!(
                "field holds {} complex elements, got {}",
                self.length(),
                values.len()
            )));
        }
        self.data.view_mut().store(0, values);
        Ok(())
    }

    /// Read the contents back as `Complex64`.
    pub fn to_complex(&self) -> Vec<Complex64> {
        let view = self.data.view();
        (0..self.length()).map(|i| view.load(i)).collect()
    }

    /// A copy of this field tagged with another location.
    pub fn to_location(&self, location: Location) -> Self {
        Self {
            location,
            ..self.clone()
        }
    }

    pub fn layout(&self) -> FieldLayout {
        self.layout
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn location(&self) -> Location {
        self.location
    }

    /// Complex elements.
    pub fn length(&self) -> usize {
        self.layout.length()
    }

    pub fn real_length(&self) -> usize {
        self.layout.real_length()
    }

    /// Bytes of storage, site norms included.
    pub fn bytes(&self) -> usize {
        let norm_bytes = match self.precision {
            Precision::Half => self.layout.volume * std::mem::size_of::<f32>(),
            _ => 0,
        };
        self.real_length() * self.precision.bytes() + norm_bytes
    }

    pub(crate) fn data(&self) -> &FieldData {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut FieldData {
        &mut self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn wilson(volume: usize) -> FieldLayout {
        FieldLayout::new(volume, 4, 3)
    }

    fn ramp(n: usize) -> Vec<Complex64> {
        (0..n)
            .map(|i| Complex64::new(0.5 + i as f64, -0.25 * i as f64))
            .collect()
    }

    #[test]
    fn layout_lengths() {
        let layout = wilson(16);
        assert_eq!(layout.site_length(), 12);
        assert_eq!(layout.length(), 192);
        assert_eq!(layout.real_length(), 384);
    }

    #[test]
    fn new_field_is_zero() {
        let param = FieldParam::new(wilson(2), Precision::Half, Location::Device);
        let f = ColorSpinorField::new(&param);
        assert!(f.to_complex().iter().all(|z| z.re == 0.0 && z.im == 0.0));
    }

    #[test]
    fn null_fields_read_as_nan_until_written() {
        for precision in [Precision::Half, Precision::Single, Precision::Double] {
            let param = FieldParam::new(wilson(2), precision, Location::Device)
                .with_create(FieldCreate::Null);
            let mut f = ColorSpinorField::new(&param);
            assert!(f.to_complex().iter().all(|z| z.re.is_nan() && z.im.is_nan()));
            f.assign_complex(&ramp(24)).unwrap();
            assert!(f.to_complex().iter().all(|z| z.re.is_finite()));
        }
    }

    #[test]
    fn half_field_without_site_elements_is_a_shape_error() {
        for layout in [FieldLayout::new(2, 0, 3), FieldLayout::new(2, 4, 0)] {
            let err = ColorSpinorField::from_complex(layout, Precision::Half, Location::Device, &[])
                .unwrap_err();
            assert!(matches!(err, SolverError::Shape(_)));
            let param = FieldParam::new(layout, Precision::Half, Location::Device);
            let f = ColorSpinorField::new(&param);
            assert!(f.to_complex().is_empty());
            assert!(f.data().view().blocks(64).is_empty());
        }
        // Empty sites are fine when nothing is stored per site.
        let f = ColorSpinorField::from_complex(
            FieldLayout::new(2, 0, 3),
            Precision::Double,
            Location::Device,
            &[],
        )
        .unwrap();
        assert_eq!(f.length(), 0);
    }

    #[test]
    fn double_round_trip_is_exact() {
        let values = ramp(24);
        let f =
            ColorSpinorField::from_complex(wilson(2), Precision::Double, Location::Device, &values)
                .unwrap();
        assert_eq!(f.to_complex(), values);
    }

    #[test]
    fn single_rounds_to_f32() {
        let values = vec![Complex64::new(1.0 / 3.0, 0.1); 12];
        let f =
            ColorSpinorField::from_complex(wilson(1), Precision::Single, Location::Device, &values)
                .unwrap();
        let back = f.to_complex();
        assert_eq!(back[0].re, (1.0f64 / 3.0) as f32 as f64);
        assert_ne!(back[0].re, 1.0 / 3.0);
    }

    #[test]
    fn half_keeps_relative_accuracy_per_site() {
        // Second site is 1e-9 times smaller than the first; the per-site
        // norm keeps it from flushing to zero.
        let mut values = ramp(12);
        values.extend(ramp(12).into_iter().map(|z| z * 1e-9));
        let f =
            ColorSpinorField::from_complex(wilson(2), Precision::Half, Location::Device, &values)
                .unwrap();
        let back = f.to_complex();
        for (site, scale) in [(0usize, 1.0), (1, 1e-9)] {
            let max = 11.5 * scale;
            for j in 0..12 {
                let i = site * 12 + j;
                assert_abs_diff_eq!(back[i].re, values[i].re, epsilon = max / HALF_MAX);
                assert_abs_diff_eq!(back[i].im, values[i].im, epsilon = max / HALF_MAX);
            }
        }
    }

    #[test]
    fn half_propagates_non_finite_values() {
        let mut values = ramp(12);
        values[3] = Complex64::new(f64::NAN, 0.0);
        let f =
            ColorSpinorField::from_complex(wilson(1), Precision::Half, Location::Device, &values)
                .unwrap();
        assert!(f.to_complex().iter().all(|z| z.re.is_nan()));
    }

    #[test]
    fn assign_rejects_wrong_length() {
        let mut f = ColorSpinorField::new(&FieldParam::new(
            wilson(1),
            Precision::Double,
            Location::Device,
        ));
        let err = f.assign_complex(&ramp(5)).unwrap_err();
        assert!(matches!(err, SolverError::Shape(_)));
    }

    #[test]
    fn param_like_copies_shape() {
        let f = ColorSpinorField::new(&FieldParam::new(
            FieldLayout::new(8, 1, 3),
            Precision::Single,
            Location::Host,
        ));
        let p = FieldParam::like(&f).with_precision(Precision::Half);
        assert_eq!(p.layout, f.layout());
        assert_eq!(p.location, Location::Host);
        assert_eq!(p.precision, Precision::Half);
    }

    #[test]
    fn bytes_include_half_norms() {
        let f = ColorSpinorField::new(&FieldParam::new(
            wilson(4),
            Precision::Half,
            Location::Device,
        ));
        assert_eq!(f.bytes(), 96 * 2 + 4 * 4);
    }
}
