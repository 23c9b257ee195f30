//! Order statistics and the Poisson tail used by the reorg plausibility
//! check.

/// Median of a sample; even-sized samples average the middle pair. An empty
/// sample yields the type's default, matching how callers treat an empty
/// size window.
pub fn median_value<T>(values: &[T]) -> T
where
    T: Copy + Ord + Default + std::ops::Add<Output = T> + std::ops::Div<Output = T> + From<u8>,
{
    if values.is_empty() {
        return T::default();
    }
    if values.len() == 1 {
        return values[0];
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted[mid]
    } else {
        (sorted[mid - 1] + sorted[mid]) / T::from(2u8)
    }
}

/// ln P(X >= k) for X ~ Poisson(lambda).
///
/// The leading term ln pmf(k) is computed in log space; the tail ratio
/// S = 1 + lam/(k+1) + lam^2/((k+1)(k+2)) + ... converges quickly for the
/// lambda/k ranges the reorg check feeds in.
pub fn poisson_log_p_tail(lambda: f64, k: u64) -> f64 {
    if lambda <= 0.0 {
        return if k == 0 { 0.0 } else { f64::NEG_INFINITY };
    }

    let mut log_pmf = -lambda + (k as f64) * lambda.ln();
    for i in 2..=k {
        log_pmf -= (i as f64).ln();
    }

    let mut tail = 1.0f64;
    let mut term = 1.0f64;
    let mut i = k + 1;
    while term > 1e-16 && i < k + 10_000 {
        term *= lambda / (i as f64);
        tail += term;
        i += 1;
    }

    log_pmf + tail.ln()
}
