#![forbid(unsafe_code)]

//! Host-side descriptor and value types shared by every callbridge crate.
//!
//! The host never looks inside a foreign function; it only moves these
//! values across the boundary and reasons about their shapes and dtypes.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F32,
    F64,
    I32,
}

impl DType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::I32 => "i32",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    pub dims: Vec<u32>,
}

impl Shape {
    #[must_use]
    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    #[must_use]
    pub fn vector(len: u32) -> Self {
        Self { dims: vec![len] }
    }

    #[must_use]
    pub fn of(dims: &[u32]) -> Self {
        Self {
            dims: dims.to_vec(),
        }
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    #[must_use]
    pub fn element_count(&self) -> Option<u64> {
        self.dims
            .iter()
            .try_fold(1_u64, |acc, dim| acc.checked_mul(u64::from(*dim)))
    }
}

/// Shape and dtype of a value without its data. The descriptor currency
/// between host interpreters and the foreign provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AbstractValue {
    pub dtype: DType,
    pub shape: Shape,
}

impl AbstractValue {
    #[must_use]
    pub fn new(dtype: DType, shape: Shape) -> Self {
        Self { dtype, shape }
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    /// Descriptor for the same value with an extra leading batch axis.
    #[must_use]
    pub fn with_leading_axis(&self, size: u32) -> Self {
        let mut dims = Vec::with_capacity(self.shape.rank() + 1);
        dims.push(size);
        dims.extend_from_slice(&self.shape.dims);
        Self {
            dtype: self.dtype,
            shape: Shape { dims },
        }
    }

    /// Split off the leading axis: `(axis_size, inner descriptor)`.
    pub fn without_leading_axis(&self) -> Result<(u32, Self), ValueError> {
        let (first, rest) = self
            .shape
            .dims
            .split_first()
            .ok_or(ValueError::RankZeroAxisSplit)?;
        Ok((
            *first,
            Self {
                dtype: self.dtype,
                shape: Shape {
                    dims: rest.to_vec(),
                },
            },
        ))
    }

    fn write_fingerprint(&self, out: &mut String) {
        let _ = write!(out, "{}[", self.dtype.as_str());
        for (idx, dim) in self.shape.dims.iter().enumerate() {
            if idx > 0 {
                out.push('x');
            }
            let _ = write!(out, "{dim}");
        }
        out.push(']');
    }
}

// ── Concrete values ────────────────────────────────────────────────

/// Typed element storage; the variant fixes the dtype.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ElementBuffer {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I32(Vec<i32>),
}

impl ElementBuffer {
    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::F32(_) => DType::F32,
            Self::F64(_) => DType::F64,
            Self::I32(_) => DType::I32,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::F32(v) => v.len(),
            Self::F64(v) => v.len(),
            Self::I32(v) => v.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slice_range(&self, start: usize, end: usize) -> Self {
        match self {
            Self::F32(v) => Self::F32(v[start..end].to_vec()),
            Self::F64(v) => Self::F64(v[start..end].to_vec()),
            Self::I32(v) => Self::I32(v[start..end].to_vec()),
        }
    }

    fn gather(&self, indices: &[usize]) -> Self {
        match self {
            Self::F32(v) => Self::F32(indices.iter().map(|&i| v[i]).collect()),
            Self::F64(v) => Self::F64(indices.iter().map(|&i| v[i]).collect()),
            Self::I32(v) => Self::I32(indices.iter().map(|&i| v[i]).collect()),
        }
    }

    fn extend_from(&mut self, other: &Self) -> Result<(), ValueError> {
        match (self, other) {
            (Self::F32(dst), Self::F32(src)) => dst.extend_from_slice(src),
            (Self::F64(dst), Self::F64(src)) => dst.extend_from_slice(src),
            (Self::I32(dst), Self::I32(src)) => dst.extend_from_slice(src),
            (dst, src) => {
                return Err(ValueError::StackDTypeMismatch {
                    expected: dst.dtype(),
                    actual: src.dtype(),
                });
            }
        }
        Ok(())
    }
}

/// A concrete array crossing the host/foreign boundary. Rank 0 is a scalar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayValue {
    shape: Shape,
    data: ElementBuffer,
}

impl ArrayValue {
    pub fn new(shape: Shape, data: ElementBuffer) -> Result<Self, ValueError> {
        let expected = shape.element_count().ok_or(ValueError::ShapeOverflow {
            shape: shape.clone(),
        })?;
        if expected != data.len() as u64 {
            return Err(ValueError::ElementCountMismatch {
                shape,
                expected_count: expected,
                actual_count: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    #[must_use]
    pub fn scalar_f32(value: f32) -> Self {
        Self {
            shape: Shape::scalar(),
            data: ElementBuffer::F32(vec![value]),
        }
    }

    #[must_use]
    pub fn scalar_f64(value: f64) -> Self {
        Self {
            shape: Shape::scalar(),
            data: ElementBuffer::F64(vec![value]),
        }
    }

    #[must_use]
    pub fn scalar_i32(value: i32) -> Self {
        Self {
            shape: Shape::scalar(),
            data: ElementBuffer::I32(vec![value]),
        }
    }

    #[must_use]
    pub fn vector_f32(values: &[f32]) -> Self {
        Self {
            shape: Shape::vector(values.len() as u32),
            data: ElementBuffer::F32(values.to_vec()),
        }
    }

    #[must_use]
    pub fn vector_f64(values: &[f64]) -> Self {
        Self {
            shape: Shape::vector(values.len() as u32),
            data: ElementBuffer::F64(values.to_vec()),
        }
    }

    #[must_use]
    pub fn vector_i32(values: &[i32]) -> Self {
        Self {
            shape: Shape::vector(values.len() as u32),
            data: ElementBuffer::I32(values.to_vec()),
        }
    }

    pub fn zeros(dtype: DType, shape: Shape) -> Result<Self, ValueError> {
        let count = shape.element_count().ok_or(ValueError::ShapeOverflow {
            shape: shape.clone(),
        })? as usize;
        let data = match dtype {
            DType::F32 => ElementBuffer::F32(vec![0.0; count]),
            DType::F64 => ElementBuffer::F64(vec![0.0; count]),
            DType::I32 => ElementBuffer::I32(vec![0; count]),
        };
        Ok(Self { shape, data })
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    #[must_use]
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn buffer(&self) -> &ElementBuffer {
        &self.data
    }

    #[must_use]
    pub fn aval(&self) -> AbstractValue {
        AbstractValue {
            dtype: self.dtype(),
            shape: self.shape.clone(),
        }
    }

    /// Widen every element to f64, in row-major order.
    #[must_use]
    pub fn to_f64_vec(&self) -> Vec<f64> {
        match &self.data {
            ElementBuffer::F32(v) => v.iter().map(|&x| f64::from(x)).collect(),
            ElementBuffer::F64(v) => v.clone(),
            ElementBuffer::I32(v) => v.iter().map(|&x| f64::from(x)).collect(),
        }
    }

    /// Rebuild a value of the given dtype from f64 elements. Float targets
    /// round to nearest; i32 truncates toward zero.
    pub fn from_f64_vec(
        dtype: DType,
        shape: Shape,
        values: Vec<f64>,
    ) -> Result<Self, ValueError> {
        let data = match dtype {
            DType::F32 => ElementBuffer::F32(values.iter().map(|&x| x as f32).collect()),
            DType::F64 => ElementBuffer::F64(values),
            DType::I32 => ElementBuffer::I32(values.iter().map(|&x| x as i32).collect()),
        };
        Self::new(shape, data)
    }

    /// Slice out index `index` of the leading axis, dropping that axis.
    pub fn slice_axis0(&self, index: usize) -> Result<Self, ValueError> {
        let axis_size = *self
            .shape
            .dims
            .first()
            .ok_or(ValueError::RankZeroAxisSplit)? as usize;
        if index >= axis_size {
            return Err(ValueError::SliceIndexOutOfBounds { index, axis_size });
        }
        let inner = self.data.len() / axis_size;
        let data = self.data.slice_range(index * inner, (index + 1) * inner);
        Ok(Self {
            shape: Shape {
                dims: self.shape.dims[1..].to_vec(),
            },
            data,
        })
    }

    /// Stack equally shaped values along a new leading axis.
    pub fn stack_axis0(slices: &[Self]) -> Result<Self, ValueError> {
        let first = slices.first().ok_or(ValueError::EmptyStack)?;
        let mut data = first.data.clone();
        for value in &slices[1..] {
            if value.shape != first.shape {
                return Err(ValueError::StackShapeMismatch {
                    expected: first.shape.clone(),
                    actual: value.shape.clone(),
                });
            }
            data.extend_from(&value.data)?;
        }
        let mut dims = Vec::with_capacity(first.shape.rank() + 1);
        dims.push(slices.len() as u32);
        dims.extend_from_slice(&first.shape.dims);
        Ok(Self {
            shape: Shape { dims },
            data,
        })
    }

    /// Transpose so that axis `axis` becomes the leading axis; the relative
    /// order of the remaining axes is preserved.
    pub fn move_axis_to_front(&self, axis: usize) -> Result<Self, ValueError> {
        let rank = self.rank();
        if axis >= rank {
            return Err(ValueError::AxisOutOfBounds { axis, rank });
        }
        if axis == 0 {
            return Ok(self.clone());
        }
        let mut perm = Vec::with_capacity(rank);
        perm.push(axis);
        perm.extend((0..rank).filter(|&i| i != axis));
        Ok(self.transpose_by(&perm))
    }

    /// Inverse of [`move_axis_to_front`]: the leading axis moves to
    /// position `axis`.
    pub fn move_front_to_axis(&self, axis: usize) -> Result<Self, ValueError> {
        let rank = self.rank();
        if axis >= rank {
            return Err(ValueError::AxisOutOfBounds { axis, rank });
        }
        if axis == 0 {
            return Ok(self.clone());
        }
        // perm[i] names the source axis feeding output axis i.
        let mut perm = Vec::with_capacity(rank);
        perm.extend(1..=axis);
        perm.push(0);
        perm.extend((axis + 1)..rank);
        Ok(self.transpose_by(&perm))
    }

    fn transpose_by(&self, perm: &[usize]) -> Self {
        let old_dims = &self.shape.dims;
        let rank = old_dims.len();

        let mut old_strides = vec![1_usize; rank];
        for i in (0..rank.saturating_sub(1)).rev() {
            old_strides[i] = old_strides[i + 1] * old_dims[i + 1] as usize;
        }

        let new_dims: Vec<u32> = perm.iter().map(|&p| old_dims[p]).collect();
        let total = self.data.len();
        let mut indices = Vec::with_capacity(total);
        let mut multi = vec![0_usize; rank];
        for _ in 0..total {
            let src: usize = multi
                .iter()
                .enumerate()
                .map(|(i, &idx)| idx * old_strides[perm[i]])
                .sum();
            indices.push(src);
            // Row-major increment over the output index space.
            for i in (0..rank).rev() {
                multi[i] += 1;
                if multi[i] < new_dims[i] as usize {
                    break;
                }
                multi[i] = 0;
            }
        }

        Self {
            shape: Shape { dims: new_dims },
            data: self.data.gather(&indices),
        }
    }
}

// ── Abstract signatures ────────────────────────────────────────────

/// Ordered per-argument descriptors for one call site; the cache key for
/// staged compilation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AbstractSignature {
    pub avals: SmallVec<[AbstractValue; 4]>,
}

impl AbstractSignature {
    #[must_use]
    pub fn new(avals: impl IntoIterator<Item = AbstractValue>) -> Self {
        Self {
            avals: avals.into_iter().collect(),
        }
    }

    /// Derive the signature of a concrete argument list.
    #[must_use]
    pub fn of_args(args: &[ArrayValue]) -> Self {
        Self {
            avals: args.iter().map(ArrayValue::aval).collect(),
        }
    }

    #[must_use]
    pub fn arity(&self) -> usize {
        self.avals.len()
    }

    /// Stable textual form, e.g. `f32[10],f64[]`. Used for cache-key
    /// payloads and error attribution.
    #[must_use]
    pub fn canonical_fingerprint(&self) -> String {
        let mut out = String::new();
        for (idx, aval) in self.avals.iter().enumerate() {
            if idx > 0 {
                out.push(',');
            }
            aval.write_fingerprint(&mut out);
        }
        out
    }
}

// ── Batching descriptors ───────────────────────────────────────────

/// Per-argument batch axis; `None` is the unbatched sentinel. Length always
/// equals the program arity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchDescriptor {
    pub axes: Vec<Option<usize>>,
}

impl BatchDescriptor {
    #[must_use]
    pub fn new(axes: Vec<Option<usize>>) -> Self {
        Self { axes }
    }

    #[must_use]
    pub fn unbatched(arity: usize) -> Self {
        Self {
            axes: vec![None; arity],
        }
    }

    #[must_use]
    pub fn arity(&self) -> usize {
        self.axes.len()
    }

    #[must_use]
    pub fn is_unbatched(&self) -> bool {
        self.axes.iter().all(Option::is_none)
    }

    /// Which arguments carry a batch axis.
    #[must_use]
    pub fn mapped_mask(&self) -> Vec<bool> {
        self.axes.iter().map(Option::is_some).collect()
    }
}

/// Which transformation is active for one invocation. Carried on errors so
/// failures name the rule that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallContext {
    Concrete,
    ShapeOnly,
    Staged,
    Batched,
    Tangent,
}

impl CallContext {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Concrete => "eval",
            Self::ShapeOnly => "abstract",
            Self::Staged => "stage",
            Self::Batched => "batch",
            Self::Tangent => "jvp",
        }
    }
}

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueError {
    ShapeOverflow {
        shape: Shape,
    },
    ElementCountMismatch {
        shape: Shape,
        expected_count: u64,
        actual_count: usize,
    },
    RankZeroAxisSplit,
    SliceIndexOutOfBounds {
        index: usize,
        axis_size: usize,
    },
    EmptyStack,
    StackShapeMismatch {
        expected: Shape,
        actual: Shape,
    },
    StackDTypeMismatch {
        expected: DType,
        actual: DType,
    },
    AxisOutOfBounds {
        axis: usize,
        rank: usize,
    },
}

impl std::fmt::Display for ValueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ShapeOverflow { shape } => {
                write!(f, "shape element count overflowed: {:?}", shape.dims)
            }
            Self::ElementCountMismatch {
                shape,
                expected_count,
                actual_count,
            } => write!(
                f,
                "element count mismatch for shape {:?}: expected {}, got {}",
                shape.dims, expected_count, actual_count
            ),
            Self::RankZeroAxisSplit => {
                write!(f, "cannot split an axis off a rank-0 value")
            }
            Self::SliceIndexOutOfBounds { index, axis_size } => write!(
                f,
                "axis-slice index {} out of bounds for axis size {}",
                index, axis_size
            ),
            Self::EmptyStack => write!(f, "cannot stack an empty slice list"),
            Self::StackShapeMismatch { expected, actual } => write!(
                f,
                "stack shape mismatch: expected {:?}, got {:?}",
                expected.dims, actual.dims
            ),
            Self::StackDTypeMismatch { expected, actual } => write!(
                f,
                "stack dtype mismatch: expected {:?}, got {:?}",
                expected, actual
            ),
            Self::AxisOutOfBounds { axis, rank } => {
                write!(f, "axis {} out of bounds for rank {}", axis, rank)
            }
        }
    }
}

impl std::error::Error for ValueError {}
