//! Global gradient-norm clipping.

use candle_core::backprop::GradStore;
use candle_core::{DType, Var};
use seqtag_core::Result;

const CLIP_EPS: f64 = 1e-6;

/// Factor applied to every gradient: 1 when the norm is within bounds,
/// otherwise `max_norm / (norm + eps)`.
pub fn clip_coefficient(total_norm: f64, max_norm: f64) -> f64 {
    if total_norm > max_norm {
        max_norm / (total_norm + CLIP_EPS)
    } else {
        1.0
    }
}

/// L2 norm of the concatenation of all gradients present for `vars`.
pub fn global_grad_norm(grads: &GradStore, vars: &[Var]) -> Result<f64> {
    let mut sum_squares = 0.0f64;
    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            let sq = grad
                .to_dtype(DType::F32)?
                .sqr()?
                .sum_all()?
                .to_scalar::<f32>()?;
            sum_squares += f64::from(sq);
        }
    }
    Ok(sum_squares.sqrt())
}

/// Rescale the gradients of `vars` in place so their global norm does not
/// exceed `max_norm`. Returns the norm measured before clipping, which may
/// be non-finite; in that case the gradients are left untouched.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let total_norm = global_grad_norm(grads, vars)?;
    if !total_norm.is_finite() {
        return Ok(total_norm);
    }

    let coef = clip_coefficient(total_norm, max_norm);
    if coef < 1.0 {
        for var in vars {
            if let Some(grad) = grads.remove(var.as_tensor()) {
                grads.insert(var.as_tensor(), grad.affine(coef, 0.0)?);
            }
        }
    }
    Ok(total_norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};

    fn grads_for(values: &[f32]) -> (Var, GradStore) {
        let var = Var::from_tensor(&Tensor::zeros(values.len(), DType::F32, &Device::Cpu).unwrap())
            .unwrap();
        let target = Tensor::new(values, &Device::Cpu).unwrap();
        // d/dw (w . target) = target
        let loss = var.as_tensor().mul(&target).unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        (var, grads)
    }

    #[test]
    fn test_coefficient() {
        assert_eq!(clip_coefficient(3.0, 5.0), 1.0);
        assert_eq!(clip_coefficient(5.0, 5.0), 1.0);
        assert!((clip_coefficient(10.0, 5.0) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_large_gradient_is_scaled_down_along_same_direction() {
        let (var, mut grads) = grads_for(&[30.0, 40.0]);
        let before = clip_grad_norm(&mut grads, &[var.clone()], 5.0).unwrap();
        assert!((before - 50.0).abs() < 1e-4);

        let after = global_grad_norm(&grads, &[var.clone()]).unwrap();
        assert!(after <= 5.0 + 1e-6);

        let clipped: Vec<f32> = grads.get(var.as_tensor()).unwrap().to_vec1().unwrap();
        // Same direction: the ratio of components is preserved.
        assert!((clipped[0] / clipped[1] - 0.75).abs() < 1e-5);
        assert!(clipped[0] > 0.0 && clipped[1] > 0.0);
    }

    #[test]
    fn test_small_gradient_is_unchanged() {
        let (var, mut grads) = grads_for(&[0.3, -0.4]);
        let norm = clip_grad_norm(&mut grads, &[var.clone()], 5.0).unwrap();
        assert!((norm - 0.5).abs() < 1e-6);
        let kept: Vec<f32> = grads.get(var.as_tensor()).unwrap().to_vec1().unwrap();
        assert_eq!(kept, vec![0.3, -0.4]);
    }

    #[test]
    fn test_non_finite_norm_reported() {
        let (var, mut grads) = grads_for(&[f32::NAN, 1.0]);
        let norm = clip_grad_norm(&mut grads, &[var], 5.0).unwrap();
        assert!(!norm.is_finite());
    }
}
