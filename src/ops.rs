/* ------------------------------------------------------------------ */
/* Math primitives: softmax, loss, gradient norms                     */
/* ------------------------------------------------------------------ */

// Numerically stable softmax: shift by the max before exponentiating.
pub fn softmax_fwd(logits: &[f32], probs: &mut [f32]) {
    let mx = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for (p, &l) in probs.iter_mut().zip(logits.iter()) {
        *p = (l - mx).exp();
        sum += *p;
    }
    let inv = 1.0 / sum;
    for p in probs.iter_mut() {
        *p *= inv;
    }
}

pub fn cross_entropy_loss(probs: &[f32], target: usize) -> f32 {
    let p = probs[target].max(1e-10);
    -p.ln()
}

/// L2 norm over all gradient buffers taken together — the "global" norm
/// that clipping compares against, not a per-tensor norm.
pub fn global_grad_norm<'a>(grads: impl Iterator<Item = &'a [f32]>) -> f32 {
    let mut sq = 0.0f64;
    for g in grads {
        for &v in g {
            sq += (v as f64) * (v as f64);
        }
    }
    sq.sqrt() as f32
}

pub fn scale_in_place(buf: &mut [f32], factor: f32) {
    for v in buf.iter_mut() {
        *v *= factor;
    }
}
