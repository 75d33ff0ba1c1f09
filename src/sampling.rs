use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::error::ServiceError;

/// Repetition penalty, then temperature, softmax and top-p filtering.
/// Zero temperature is greedy.
#[derive(Debug)]
pub struct Sampler {
    temperature: f32,
    top_p: f32,
    repetition_penalty: f32,
    rng: StdRng,
}

impl Sampler {
    pub fn new(temperature: f32, top_p: f32, repetition_penalty: f32) -> Self {
        Self {
            temperature,
            top_p,
            repetition_penalty,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Picks the next token id given the logits for the last position and
    /// every token id seen so far (prompt included).
    pub fn sample(&mut self, logits: &[f32], history: &[u32]) -> Result<u32, ServiceError> {
        if logits.is_empty() {
            return Err(ServiceError::GenerationFailed(
                "model returned empty logits".into(),
            ));
        }

        let mut work = logits.to_vec();
        if self.repetition_penalty > 0.0 && (self.repetition_penalty - 1.0).abs() > f32::EPSILON {
            apply_repetition_penalty(&mut work, history, self.repetition_penalty);
        }

        if self.temperature <= f32::EPSILON {
            return Ok(argmax(&work) as u32);
        }

        for logit in &mut work {
            *logit /= self.temperature;
        }
        let probs = softmax(&work);
        let probs = nucleus(&probs, self.top_p);
        Ok(self.draw(&probs) as u32)
    }

    fn draw(&mut self, probs: &[f32]) -> usize {
        let total: f32 = probs.iter().sum();
        if total <= 0.0 || !total.is_finite() {
            return argmax(probs);
        }
        let mut target = self.rng.r#gen::<f32>() * total;
        for (idx, &p) in probs.iter().enumerate() {
            if p <= 0.0 {
                continue;
            }
            target -= p;
            if target <= 0.0 {
                return idx;
            }
        }
        argmax(probs)
    }
}

/// Divides positive logits and multiplies negative ones, so repeated tokens
/// always become less likely.
fn apply_repetition_penalty(logits: &mut [f32], history: &[u32], penalty: f32) {
    let mut seen = vec![false; logits.len()];
    for &id in history {
        let idx = id as usize;
        if idx >= logits.len() || seen[idx] {
            continue;
        }
        seen[idx] = true;
        if logits[idx] > 0.0 {
            logits[idx] /= penalty;
        } else {
            logits[idx] *= penalty;
        }
    }
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    if sum > 0.0 && sum.is_finite() {
        exps.into_iter().map(|e| e / sum).collect()
    } else {
        vec![1.0 / logits.len() as f32; logits.len()]
    }
}

/// Keeps the smallest set of most likely tokens whose mass reaches `top_p`.
/// The most likely token always survives.
fn nucleus(probs: &[f32], top_p: f32) -> Vec<f32> {
    if top_p >= 1.0 {
        return probs.to_vec();
    }
    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_by(|&a, &b| {
        probs[b]
            .partial_cmp(&probs[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut kept = vec![0.0; probs.len()];
    let mut cumulative = 0.0;
    for (rank, &idx) in order.iter().enumerate() {
        if rank > 0 && cumulative >= top_p {
            break;
        }
        kept[idx] = probs[idx];
        cumulative += probs[idx];
    }
    kept
}

fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (idx, &v)| {
            if v > best.1 { (idx, v) } else { best }
        })
        .0
}

/// Truncates `text` at the first stop sequence (in the given order) that it
/// contains. Later sequences are not consulted once one matched.
pub fn apply_stop_sequences(text: &str, stop_sequences: &[String]) -> String {
    for stop in stop_sequences {
        if stop.is_empty() {
            continue;
        }
        if let Some(idx) = text.find(stop.as_str()) {
            return text[..idx].to_string();
        }
    }
    text.to_string()
}
