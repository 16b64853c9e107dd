//! Loss functions and their gradients with respect to the model outputs.
use crate::AdvFloat;
use ndarray::{Array2, ArrayD, ArrayView1};

/// Softmax cross-entropy with mean reduction over the batch.
///
/// Returns the loss and its gradient with respect to the logits,
/// `(softmax(logits) - onehot(labels)) / batch_size`. Uses the log-sum-exp
/// shift so large logits do not overflow.
///
/// # Panics
/// If a label is out of range for the logit width
pub fn cross_entropy(
    logits: &Array2<AdvFloat>,
    labels: ArrayView1<usize>,
) -> (AdvFloat, Array2<AdvFloat>) {
    let batch = logits.nrows();
    debug_assert_eq!(batch, labels.len());
    let n = batch as AdvFloat;
    let mut grad = Array2::<AdvFloat>::zeros(logits.raw_dim());
    let mut total = 0.;
    for (i, row) in logits.outer_iter().enumerate() {
        let label = labels[i];
        assert!(label < row.len());
        let shift = row.fold(AdvFloat::NEG_INFINITY, |a, &b| a.max(b));
        let exp = row.mapv(|v| (v - shift).exp());
        let denom = exp.sum();
        total += denom.ln() + shift - row[label];
        let mut grad_row = grad.row_mut(i);
        grad_row.assign(&(&exp / denom));
        grad_row[label] -= 1.;
    }
    (total / n, grad / n)
}

/// Alignment objective for the refinement loop: with per-sample
/// displacements `x = attack_mid - original_mid` and
/// `y = current_mid - original_mid`, the loss is `sum(x * y) / batch_size`
/// and its gradient with respect to the current activation is
/// `x / batch_size`.
pub fn alignment_projection(
    attack_mid: &ArrayD<AdvFloat>,
    current_mid: &ArrayD<AdvFloat>,
    original_mid: &ArrayD<AdvFloat>,
) -> (AdvFloat, ArrayD<AdvFloat>) {
    debug_assert_eq!(attack_mid.shape(), current_mid.shape());
    debug_assert_eq!(attack_mid.shape(), original_mid.shape());
    let n = attack_mid.shape()[0] as AdvFloat;
    let x = attack_mid - original_mid;
    let y = current_mid - original_mid;
    let loss = (&x * &y).sum() / n;
    (loss, x / n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array1};

    #[test]
    fn test_cross_entropy_gradient_is_softmax_minus_onehot() {
        let logits = array![[2., 0., -1.], [0.5, 0.5, 3.]];
        let labels = Array1::from_vec(vec![0_usize, 2]);
        let (loss, grad) = cross_entropy(&logits, labels.view());

        for (i, row) in logits.outer_iter().enumerate() {
            let exp = row.mapv(AdvFloat::exp);
            let denom = exp.sum();
            for j in 0..row.len() {
                let mut expected = exp[j] / denom;
                if j == labels[i] {
                    expected -= 1.;
                }
                assert_abs_diff_eq!(grad[[i, j]], expected / 2., epsilon = 1e-12);
            }
        }
        assert!(loss > 0.);
    }

    #[test]
    fn test_cross_entropy_is_shift_invariant() {
        let logits = array![[1000., 1001., 999.]];
        let labels = Array1::from_vec(vec![1_usize]);
        let (loss, grad) = cross_entropy(&logits, labels.view());
        assert!(loss.is_finite());
        assert!(grad.iter().all(|g| g.is_finite()));

        let (small_loss, small_grad) = cross_entropy(&array![[0., 1., -1.]], labels.view());
        assert_abs_diff_eq!(loss, small_loss, epsilon = 1e-9);
        assert_abs_diff_eq!(grad[[0, 0]], small_grad[[0, 0]], epsilon = 1e-12);
    }

    #[test]
    fn test_alignment_projection_gradient() {
        let original = array![[1., 1.], [0., 0.]].into_dyn();
        let attack = array![[3., 0.], [1., 2.]].into_dyn();
        let current = array![[2., 2.], [0.5, 1.]].into_dyn();
        let (loss, grad) = alignment_projection(&attack, &current, &original);

        // x = ((2, -1), (1, 2)), y = ((1, 1), (0.5, 1)).
        assert_abs_diff_eq!(loss, (2. - 1. + 0.5 + 2.) / 2., epsilon = 1e-12);
        assert_abs_diff_eq!(grad[[0, 0]], 1., epsilon = 1e-12);
        assert_abs_diff_eq!(grad[[0, 1]], -0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(grad[[1, 1]], 1., epsilon = 1e-12);
    }
}
