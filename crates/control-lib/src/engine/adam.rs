//! Adam optimizer over flat parameter vectors

const EPSILON: f32 = 1e-8;

#[derive(Debug, Clone)]
pub(crate) struct Adam {
    alpha: f32,
    beta1: f32,
    beta2: f32,
    m: Vec<f32>,
    v: Vec<f32>,
}

impl Adam {
    pub(crate) fn new(len: usize, alpha: f32, beta1: f32, beta2: f32) -> Self {
        Self {
            alpha,
            beta1,
            beta2,
            m: vec![0.0; len],
            v: vec![0.0; len],
        }
    }

    /// One update at (1-based) `step`. All three lengths must agree.
    pub(crate) fn step(&mut self, params: &mut [f32], grads: &[f32], step: u64) {
        debug_assert_eq!(params.len(), grads.len());
        debug_assert_eq!(params.len(), self.m.len());

        let t = step.max(1) as i32;
        let bias1 = 1.0 - self.beta1.powi(t);
        let bias2 = 1.0 - self.beta2.powi(t);

        let moments = self.m.iter_mut().zip(self.v.iter_mut());
        for ((p, g), (m, v)) in params.iter_mut().zip(grads).zip(moments) {
            *m = self.beta1 * *m + (1.0 - self.beta1) * g;
            *v = self.beta2 * *v + (1.0 - self.beta2) * g * g;
            let m_hat = *m / bias1;
            let v_hat = *v / bias2;
            *p -= self.alpha * m_hat / (v_hat.sqrt() + EPSILON);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimizes_quadratic() {
        // f(x) = (x - 3)^2
        let mut x = vec![0.0f32];
        let mut adam = Adam::new(1, 0.1, 0.9, 0.999);
        for step in 1..=500 {
            let grad = vec![2.0 * (x[0] - 3.0)];
            adam.step(&mut x, &grad, step);
        }
        assert!((x[0] - 3.0).abs() < 0.05, "x = {}", x[0]);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic]
    fn test_mismatched_lengths_panic_in_debug() {
        let mut x = vec![1.0f32, 2.0];
        let mut adam = Adam::new(2, 0.1, 0.9, 0.999);
        adam.step(&mut x, &[1.0], 1);
    }
}
