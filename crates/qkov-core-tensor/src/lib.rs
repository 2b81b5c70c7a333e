use anyhow::{Result, bail};
use qkov_core_kernel::cpu_matmul::{matmul_arr_f64, matvec_arr_f64, matvec_t_arr_f64};
use smallvec::SmallVec;
use std::ops::Range;

pub mod store;
pub mod view;

pub use store::WeightStore;
pub use view::{DType, TensorEntry, TensorKind, TensorView, register_tensor_registry_formats};

pub type ShapeBuf = SmallVec<[usize; 4]>;

/// An owned, named, dense `f64` tensor in row-major order.
///
/// Tensors are never mutated after construction: every operation below
/// returns a new tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    name: String,
    shape: ShapeBuf,
    data: Vec<f64>,
}

impl Tensor {
    pub fn new(name: impl Into<String>, shape: &[usize], data: Vec<f64>) -> Result<Self> {
        let name = name.into();
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            bail!(
                "tensor '{}': shape {:?} needs {} elements, got {}",
                name,
                shape,
                expected,
                data.len()
            );
        }
        Ok(Self {
            name,
            shape: shape.iter().copied().collect(),
            data,
        })
    }

    pub fn zeros(name: impl Into<String>, shape: &[usize]) -> Self {
        let n = shape.iter().product();
        Self {
            name: name.into(),
            shape: shape.iter().copied().collect(),
            data: vec![0.0; n],
        }
    }

    /// Square identity matrix.
    pub fn eye(name: impl Into<String>, n: usize) -> Self {
        let mut t = Self::zeros(name, &[n, n]);
        for i in 0..n {
            t.data[i * n + i] = 1.0;
        }
        t
    }

    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline(always)]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[inline(always)]
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    #[inline(always)]
    pub fn num_elements(&self) -> usize {
        self.data.len()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// `(rows, cols)` of a rank-2 tensor.
    pub fn dims2(&self) -> Result<(usize, usize)> {
        match self.shape.as_slice() {
            [r, c] => Ok((*r, *c)),
            other => bail!("tensor '{}': expected rank 2, got shape {:?}", self.name, other),
        }
    }

    /// Length of a rank-1 tensor.
    pub fn dims1(&self) -> Result<usize> {
        match self.shape.as_slice() {
            [n] => Ok(*n),
            other => bail!("tensor '{}': expected rank 1, got shape {:?}", self.name, other),
        }
    }

    pub fn row(&self, i: usize) -> Result<&[f64]> {
        let (rows, cols) = self.dims2()?;
        if i >= rows {
            bail!("tensor '{}': row {} out of range ({} rows)", self.name, i, rows);
        }
        Ok(&self.data[i * cols..(i + 1) * cols])
    }

    pub fn column(&self, j: usize) -> Result<Vec<f64>> {
        let (rows, cols) = self.dims2()?;
        if j >= cols {
            bail!("tensor '{}': column {} out of range ({} columns)", self.name, j, cols);
        }
        Ok((0..rows).map(|i| self.data[i * cols + j]).collect())
    }

    /// Copy of the rows in `range`.
    pub fn slice_rows(&self, range: Range<usize>) -> Result<Tensor> {
        let (rows, cols) = self.dims2()?;
        if range.start > range.end || range.end > rows {
            bail!("tensor '{}': row range {:?} out of bounds ({} rows)", self.name, range, rows);
        }
        let n = range.end - range.start;
        let data = self.data[range.start * cols..range.end * cols].to_vec();
        Tensor::new(self.name.clone(), &[n, cols], data)
    }

    /// Copy of the columns in `range`.
    pub fn slice_cols(&self, range: Range<usize>) -> Result<Tensor> {
        let (rows, cols) = self.dims2()?;
        if range.start > range.end || range.end > cols {
            bail!("tensor '{}': column range {:?} out of bounds ({} columns)", self.name, range, cols);
        }
        let n = range.end - range.start;
        let mut data = Vec::with_capacity(rows * n);
        for row in self.data.chunks_exact(cols) {
            data.extend_from_slice(&row[range.clone()]);
        }
        Tensor::new(self.name.clone(), &[rows, n], data)
    }

    pub fn transpose(&self) -> Result<Tensor> {
        let (rows, cols) = self.dims2()?;
        let mut data = vec![0.0; rows * cols];
        for i in 0..rows {
            for j in 0..cols {
                data[j * rows + i] = self.data[i * cols + j];
            }
        }
        Tensor::new(self.name.clone(), &[cols, rows], data)
    }

    /// Stack rank-2 tensors with equal column counts on top of each other.
    pub fn concat_rows(name: impl Into<String>, parts: &[Tensor]) -> Result<Tensor> {
        let name = name.into();
        let Some(first) = parts.first() else {
            bail!("concat_rows '{}': nothing to concatenate", name);
        };
        let (_, cols) = first.dims2()?;
        let mut rows = 0;
        let mut data = Vec::new();
        for part in parts {
            let (r, c) = part.dims2()?;
            if c != cols {
                bail!("concat_rows '{}': column mismatch {} vs {}", name, c, cols);
            }
            rows += r;
            data.extend_from_slice(&part.data);
        }
        Tensor::new(name, &[rows, cols], data)
    }

    /// self · other, delegating to the CPU kernel.
    pub fn matmul(&self, other: &Tensor) -> Result<Tensor> {
        let (m, k1) = self.dims2()?;
        let (k2, n) = other.dims2()?;
        if k1 != k2 {
            bail!(
                "matmul: shape mismatch: {}{:?} · {}{:?}",
                self.name,
                self.shape.as_slice(),
                other.name,
                other.shape.as_slice()
            );
        }
        let mut out = vec![0.0; m * n];
        matmul_arr_f64(&self.data, &other.data, &mut out, m, k1, n)?;
        Tensor::new(format!("{}·{}", self.name, other.name), &[m, n], out)
    }

    /// self · x
    pub fn matvec(&self, x: &[f64]) -> Result<Vec<f64>> {
        let (m, n) = self.dims2()?;
        if x.len() != n {
            bail!("matvec '{}': vector length {} != {} columns", self.name, x.len(), n);
        }
        let mut out = vec![0.0; m];
        matvec_arr_f64(&self.data, x, &mut out, m, n)?;
        Ok(out)
    }

    /// selfᵀ · x
    pub fn matvec_t(&self, x: &[f64]) -> Result<Vec<f64>> {
        let (m, n) = self.dims2()?;
        if x.len() != m {
            bail!("matvec_t '{}': vector length {} != {} rows", self.name, x.len(), m);
        }
        let mut out = vec![0.0; n];
        matvec_t_arr_f64(&self.data, x, &mut out, m, n)?;
        Ok(out)
    }

    /// Mean over columns, one value per row.
    pub fn row_means(&self) -> Result<Vec<f64>> {
        let (_, cols) = self.dims2()?;
        if cols == 0 {
            bail!("row_means '{}': no columns", self.name);
        }
        Ok(self
            .data
            .chunks_exact(cols)
            .map(|row| row.iter().sum::<f64>() / cols as f64)
            .collect())
    }

    /// Copy with new contents but the same name and shape.
    pub fn map_data(&self, f: impl FnOnce(&mut [f64]) -> Result<()>) -> Result<Tensor> {
        let mut data = self.data.clone();
        f(&mut data)?;
        Tensor::new(self.name.clone(), &self.shape, data)
    }
}
