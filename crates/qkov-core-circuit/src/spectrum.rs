use num_complex::Complex64;
use qkov_core_kernel::cpu_eigen::eigenvalues_f64;
use qkov_core_tensor::Tensor;

use crate::error::{CircuitError, Result};
use crate::slicer::HeadWeights;

/// The head's end-to-end OV operator in its own `d_head` basis:
/// `M = W_v · W_e · W_u · W_o`, square `d_head x d_head`.
///
/// Read right to left: write a head-space vector to the residual (`W_o`),
/// unembed to logits (`W_u`), re-embed as a mix of tokens (`W_e`), and read it
/// back through the value projection (`W_v`).
pub fn ov_operator(head: &HeadWeights) -> Result<Tensor> {
    let e = &head.embedding;
    // W_v·W_e first keeps the V-sized contraction at d_head rows
    let ve = head.proj.w_v.matmul(&e.w_e)?;
    let veu = ve.matmul(&e.w_u)?;
    let m = veu.matmul(&head.proj.w_o)?;

    let (r, c) = m.dims2()?;
    if r != c {
        return Err(CircuitError::ShapeMismatch(format!(
            "OV operator of head {} is {}x{}, expected square",
            head.head, r, c
        )));
    }
    Ok(m.with_name(format!("M_ov[{}]", head.head)))
}

/// Eigenvalues of the head's OV operator.
pub fn spectrum(head: &HeadWeights) -> Result<Vec<Complex64>> {
    let m = ov_operator(head)?;
    let n = m.shape()[0];
    Ok(eigenvalues_f64(m.data(), n)?)
}

/// `(angle, ln |λ|)` per eigenvalue, the coordinates of a polar scatter plot.
pub fn polar(eigenvalues: &[Complex64]) -> Vec<(f64, f64)> {
    eigenvalues
        .iter()
        .map(|z| (z.arg(), z.norm().ln()))
        .collect()
}
