//! Numerically stable evaluation of $\ln \sum_i e^{x_i}$.

/// Compute $\ln \sum_i e^{x_i}$ without overflow or underflow.
///
/// Terms equal to negative infinity contribute nothing; if every term is negative infinity (or
/// there are no terms) the result is negative infinity.
///
/// ```
/// use mbar_rs::logsumexp::logsumexp;
///
/// let x = [1000.0, 1000.0];
/// let lse = logsumexp(x.iter().copied());
/// assert!((lse - (1000.0 + 2f64.ln())).abs() < 1e-12);
/// ```
pub fn logsumexp<I>(values: I) -> f64
where
    I: IntoIterator<Item = f64>,
    I::IntoIter: Clone,
{
    let values = values.into_iter();
    let max = values.clone().fold(f64::NEG_INFINITY, f64::max);
    if max.is_infinite() {
        return max;
    }
    let sum: f64 = values.map(|x| (x - max).exp()).sum();
    max + sum.ln()
}
