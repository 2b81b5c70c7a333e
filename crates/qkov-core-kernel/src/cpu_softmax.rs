use anyhow::{Result, bail};

/// In-place softmax, shifted by the maximum so large scores cannot overflow.
pub fn softmax_inplace_f64(arr: &mut [f64]) -> Result<()> {
    let Some(max_val) = arr.iter().copied().reduce(f64::max) else {
        return Ok(());
    };
    if !max_val.is_finite() {
        bail!("softmax: non-finite maximum score {}", max_val);
    }

    arr.iter_mut().for_each(|x| *x = (*x - max_val).exp());
    let sum: f64 = arr.iter().sum();
    arr.iter_mut().for_each(|x| *x /= sum);
    Ok(())
}
