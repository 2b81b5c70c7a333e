/// Naive CPU matmul on raw slices (f64), assumes row-major layout.
/// A: m x k, B: k x n, Output: m x n
pub fn matmul_arr_f64(
    a: &[f64],
    b: &[f64],
    out: &mut [f64],
    m: usize,
    k: usize,
    n: usize,
) -> anyhow::Result<()> {
    if a.len() != m * k || b.len() != k * n || out.len() != m * n {
        anyhow::bail!("matmul: input/output length mismatch");
    }

    out.fill(0.0);
    // i-p-j order keeps both B and out walked row by row
    for i in 0..m {
        let out_row = &mut out[i * n..(i + 1) * n];
        for p in 0..k {
            let a_ip = a[i * k + p];
            if a_ip == 0.0 {
                continue;
            }
            let b_row = &b[p * n..(p + 1) * n];
            for (o, &b_pj) in out_row.iter_mut().zip(b_row) {
                *o += a_ip * b_pj;
            }
        }
    }

    Ok(())
}

/// A: m x n, x: n, Output: m
pub fn matvec_arr_f64(
    a: &[f64],
    x: &[f64],
    out: &mut [f64],
    m: usize,
    n: usize,
) -> anyhow::Result<()> {
    if a.len() != m * n || x.len() != n || out.len() != m {
        anyhow::bail!(
            "matvec: length mismatch (a={}, x={}, out={}, m={}, n={})",
            a.len(),
            x.len(),
            out.len(),
            m,
            n
        );
    }

    for (i, o) in out.iter_mut().enumerate() {
        let row = &a[i * n..(i + 1) * n];
        *o = row.iter().zip(x).map(|(w, v)| w * v).sum();
    }

    Ok(())
}

/// Transposed product without materialising the transpose.
/// A: m x n, x: m, Output: n (= Aᵀx)
pub fn matvec_t_arr_f64(
    a: &[f64],
    x: &[f64],
    out: &mut [f64],
    m: usize,
    n: usize,
) -> anyhow::Result<()> {
    if a.len() != m * n || x.len() != m || out.len() != n {
        anyhow::bail!(
            "matvec_t: length mismatch (a={}, x={}, out={}, m={}, n={})",
            a.len(),
            x.len(),
            out.len(),
            m,
            n
        );
    }

    out.fill(0.0);
    for (i, &x_i) in x.iter().enumerate() {
        let row = &a[i * n..(i + 1) * n];
        for (o, &w) in out.iter_mut().zip(row) {
            *o += w * x_i;
        }
    }

    Ok(())
}
