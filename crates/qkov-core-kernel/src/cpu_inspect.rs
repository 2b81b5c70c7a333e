// Softmax entropy
// ≈ 0 → attention collapsed onto one key
// ≈ log(n_tokens) → attention spread evenly, nothing singled out
pub fn entropy(p: &[f64]) -> f64 {
    p.iter()
        .copied()
        .filter(|&x| x > 0.0)
        .map(|x| -x * x.ln())
        .sum()
}

// Vanishing norm on a circuit output → head ignores this token
pub fn l2_norm(vec: &[f64]) -> f64 {
    vec.iter().map(|x| x * x).sum::<f64>().sqrt()
}
