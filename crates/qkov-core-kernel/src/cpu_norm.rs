/// Mean and population standard deviation over every element of `input`.
pub fn mean_std_f64(input: &[f64]) -> anyhow::Result<(f64, f64)> {
    if input.is_empty() {
        anyhow::bail!("mean_std: empty input");
    }

    let len = input.len() as f64;
    let mean = input.iter().sum::<f64>() / len;
    let var = input.iter().map(|&v| (v - mean) * (v - mean)).sum::<f64>() / len;

    Ok((mean, var.sqrt()))
}

/// Global standardization: `(x - mean) / sqrt(var + eps)` over the whole slice.
/// Returns the `(mean, denominator)` that were applied.
pub fn standardize_arr_f64(
    input: &[f64],
    output: &mut [f64],
    eps: f64,
) -> anyhow::Result<(f64, f64)> {
    if input.len() != output.len() {
        anyhow::bail!("standardize: size mismatch");
    }

    let (mean, std) = mean_std_f64(input)?;
    let denom = (std * std + eps).sqrt();
    if denom == 0.0 {
        anyhow::bail!("standardize: zero variance and eps = 0");
    }

    for (out, &x) in output.iter_mut().zip(input) {
        *out = (x - mean) / denom;
    }

    Ok((mean, denom))
}

/// In-place `x[i, j] = x[i, j] * scale[i] + bias[i]` for a row-major `rows x cols` buffer.
pub fn affine_rows_f64(
    data: &mut [f64],
    scale: &[f64],
    bias: &[f64],
    rows: usize,
    cols: usize,
) -> anyhow::Result<()> {
    if data.len() != rows * cols || scale.len() != rows || bias.len() != rows {
        anyhow::bail!("affine_rows: size mismatch");
    }

    for (row, (&s, &b)) in data.chunks_exact_mut(cols).zip(scale.iter().zip(bias)) {
        for x in row {
            *x = *x * s + b;
        }
    }

    Ok(())
}

/// In-place `x[i, j] *= scale[j]`, i.e. right-multiplication by `diag(scale)`.
pub fn scale_cols_f64(
    data: &mut [f64],
    scale: &[f64],
    rows: usize,
    cols: usize,
) -> anyhow::Result<()> {
    if data.len() != rows * cols || scale.len() != cols {
        anyhow::bail!("scale_cols: size mismatch");
    }

    for row in data.chunks_exact_mut(cols) {
        for (x, &s) in row.iter_mut().zip(scale) {
            *x *= s;
        }
    }

    Ok(())
}
