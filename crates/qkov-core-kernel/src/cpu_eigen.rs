//! Eigenvalues of a dense, general (non-symmetric) real matrix.
//!
//! Two stages:
//! 1. Householder reduction to upper Hessenberg form.
//! 2. Francis double-shift QR on the Hessenberg matrix, deflating one real
//!    root or one 2x2 block (real pair or complex-conjugate pair) at a time.
//!
//! Only eigenvalues are produced; no eigenvectors are accumulated.

use num_complex::Complex64;

/// Iteration budget per matrix dimension before giving up.
const MAX_ITER_PER_DIM: usize = 60;

/// Eigenvalues of the row-major `n x n` matrix `a`, in deflation order.
pub fn eigenvalues_f64(a: &[f64], n: usize) -> anyhow::Result<Vec<Complex64>> {
    if a.len() != n * n {
        anyhow::bail!("eigenvalues: expected {}x{} matrix, got {} elements", n, n, a.len());
    }
    if a.iter().any(|x| !x.is_finite()) {
        anyhow::bail!("eigenvalues: matrix contains non-finite values");
    }
    if n == 0 {
        return Ok(Vec::new());
    }

    let mut h: Vec<Vec<f64>> = a.chunks_exact(n).map(|row| row.to_vec()).collect();
    hessenberg_in_place(&mut h);
    hessenberg_qr(h)
}

fn hessenberg_in_place(h: &mut [Vec<f64>]) {
    let n = h.len();
    if n < 3 {
        return;
    }
    let high = n - 1;
    let mut ort = vec![0.0f64; n];

    for m in 1..high {
        let scale: f64 = (m..=high).map(|i| h[i][m - 1].abs()).sum();
        if scale == 0.0 {
            continue;
        }

        let mut hh = 0.0;
        for i in (m..=high).rev() {
            ort[i] = h[i][m - 1] / scale;
            hh += ort[i] * ort[i];
        }
        let mut g = hh.sqrt();
        if ort[m] > 0.0 {
            g = -g;
        }
        hh -= ort[m] * g;
        ort[m] -= g;

        // H = (I - u uᵀ / hh) H (I - u uᵀ / hh)
        for j in m..n {
            let f: f64 = (m..=high).rev().map(|i| ort[i] * h[i][j]).sum::<f64>() / hh;
            for i in m..=high {
                h[i][j] -= f * ort[i];
            }
        }
        for row in h.iter_mut() {
            let f: f64 = (m..=high).rev().map(|j| ort[j] * row[j]).sum::<f64>() / hh;
            for j in m..=high {
                row[j] -= f * ort[j];
            }
        }

        ort[m] *= scale;
        h[m][m - 1] = scale * g;
    }
}

fn hessenberg_qr(mut h: Vec<Vec<f64>>) -> anyhow::Result<Vec<Complex64>> {
    let nn = h.len();
    let eps = f64::EPSILON;
    let mut d = vec![0.0f64; nn];
    let mut e = vec![0.0f64; nn];

    let mut norm = 0.0;
    for (i, row) in h.iter().enumerate() {
        for x in &row[i.saturating_sub(1)..] {
            norm += x.abs();
        }
    }

    let mut n = nn as isize - 1;
    let mut exshift = 0.0;
    let mut iter = 0usize;
    let mut total_iter = 0usize;
    let budget = MAX_ITER_PER_DIM * nn.max(1);

    while n >= 0 {
        let nu = n as usize;

        // look for a single small sub-diagonal element
        let mut l = n;
        while l > 0 {
            let lu = l as usize;
            let mut s = h[lu - 1][lu - 1].abs() + h[lu][lu].abs();
            if s == 0.0 {
                s = norm;
            }
            if h[lu][lu - 1].abs() < eps * s {
                break;
            }
            l -= 1;
        }

        if l == n {
            // one root found
            h[nu][nu] += exshift;
            d[nu] = h[nu][nu];
            e[nu] = 0.0;
            n -= 1;
            iter = 0;
        } else if l == n - 1 {
            // two roots found
            let w = h[nu][nu - 1] * h[nu - 1][nu];
            let p = (h[nu - 1][nu - 1] - h[nu][nu]) / 2.0;
            let q = p * p + w;
            let mut z = q.abs().sqrt();
            h[nu][nu] += exshift;
            h[nu - 1][nu - 1] += exshift;
            let x = h[nu][nu];

            if q >= 0.0 {
                z = if p >= 0.0 { p + z } else { p - z };
                d[nu - 1] = x + z;
                d[nu] = d[nu - 1];
                if z != 0.0 {
                    d[nu] = x - w / z;
                }
                e[nu - 1] = 0.0;
                e[nu] = 0.0;
            } else {
                d[nu - 1] = x + p;
                d[nu] = x + p;
                e[nu - 1] = z;
                e[nu] = -z;
            }
            n -= 2;
            iter = 0;
        } else {
            total_iter += 1;
            if total_iter > budget {
                anyhow::bail!("eigenvalues: QR iteration did not converge");
            }

            let mut x = h[nu][nu];
            let mut y = h[nu - 1][nu - 1];
            let mut w = h[nu][nu - 1] * h[nu - 1][nu];

            // exceptional shifts break cycles
            if iter == 10 {
                exshift += x;
                for (i, row) in h.iter_mut().enumerate().take(nu + 1) {
                    row[i] -= x;
                }
                let s = h[nu][nu - 1].abs() + h[nu - 1][nu - 2].abs();
                x = 0.75 * s;
                y = x;
                w = -0.4375 * s * s;
            }
            if iter == 30 {
                let mut s = (y - x) / 2.0;
                s = s * s + w;
                if s > 0.0 {
                    s = s.sqrt();
                    if y < x {
                        s = -s;
                    }
                    s = x - w / ((y - x) / 2.0 + s);
                    for (i, row) in h.iter_mut().enumerate().take(nu + 1) {
                        row[i] -= s;
                    }
                    exshift += s;
                    x = 0.964;
                    y = x;
                    w = x;
                }
            }
            iter += 1;

            // look for two consecutive small sub-diagonal elements
            let lu = l as usize;
            let mut m = nu - 2;
            let mut p: f64;
            let mut q: f64;
            let mut r: f64;
            loop {
                let z = h[m][m];
                let rx = x - z;
                let sy = y - z;
                p = (rx * sy - w) / h[m + 1][m] + h[m][m + 1];
                q = h[m + 1][m + 1] - z - rx - sy;
                r = h[m + 2][m + 1];
                let s = p.abs() + q.abs() + r.abs();
                p /= s;
                q /= s;
                r /= s;
                if m == lu {
                    break;
                }
                if h[m][m - 1].abs() * (q.abs() + r.abs())
                    < eps * (p.abs() * (h[m - 1][m - 1].abs() + z.abs() + h[m + 1][m + 1].abs()))
                {
                    break;
                }
                m -= 1;
            }

            for i in (m + 2)..=nu {
                h[i][i - 2] = 0.0;
                if i > m + 2 {
                    h[i][i - 3] = 0.0;
                }
            }

            // double QR step on rows l..=n, columns m..=n
            for k in m..nu {
                let notlast = k != nu - 1;
                let col_scale = if k != m {
                    p = h[k][k - 1];
                    q = h[k + 1][k - 1];
                    r = if notlast { h[k + 2][k - 1] } else { 0.0 };
                    let scale = p.abs() + q.abs() + r.abs();
                    if scale == 0.0 {
                        continue;
                    }
                    p /= scale;
                    q /= scale;
                    r /= scale;
                    scale
                } else {
                    0.0
                };

                let mut s = (p * p + q * q + r * r).sqrt();
                if p < 0.0 {
                    s = -s;
                }
                if s == 0.0 {
                    continue;
                }

                if k != m {
                    h[k][k - 1] = -s * col_scale;
                } else if lu != m {
                    h[k][k - 1] = -h[k][k - 1];
                }
                p += s;
                let x = p / s;
                let y = q / s;
                let z = r / s;
                q /= p;
                r /= p;

                // row modification
                for j in k..nn {
                    let mut t = h[k][j] + q * h[k + 1][j];
                    if notlast {
                        t += r * h[k + 2][j];
                        h[k + 2][j] -= t * z;
                    }
                    h[k][j] -= t * x;
                    h[k + 1][j] -= t * y;
                }

                // column modification
                for row in h.iter_mut().take(nu.min(k + 3) + 1) {
                    let mut t = x * row[k] + y * row[k + 1];
                    if notlast {
                        t += z * row[k + 2];
                        row[k + 2] -= t * r;
                    }
                    row[k] -= t;
                    row[k + 1] -= t * q;
                }
            }
        }
    }

    Ok(d.into_iter()
        .zip(e)
        .map(|(re, im)| Complex64::new(re, im))
        .collect())
}
