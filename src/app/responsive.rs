use serde::{Deserialize, Serialize};

pub const DEFAULT_BREAKPOINTS: [u32; 5] = [320, 640, 960, 1280, 1920];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "lowercase")]
pub enum ResponsivePolicy {
    /// Configured widths below the original, plus the original.
    Breakpoints { widths: Vec<u32> },
    /// Divide by `step` from the original down to `min_width`.
    Geometric {
        step: f64,
        min_width: u32,
        max_variants: usize,
    },
}

impl Default for ResponsivePolicy {
    fn default() -> Self {
        Self::Breakpoints {
            widths: DEFAULT_BREAKPOINTS.to_vec(),
        }
    }
}

/// Ascending, deduplicated target widths for an original of `original` pixels.
/// Never exceeds the original and always contains it.
pub fn widths(original: u32, policy: &ResponsivePolicy) -> Vec<u32> {
    let mut widths = match policy {
        ResponsivePolicy::Breakpoints { widths } => {
            let mut selected: Vec<u32> = widths
                .iter()
                .copied()
                .filter(|width| *width > 0 && *width < original)
                .collect();
            selected.push(original);
            selected
        }
        ResponsivePolicy::Geometric {
            step,
            min_width,
            max_variants,
        } => geometric(original, *step, *min_width, *max_variants),
    };
    widths.sort_unstable();
    widths.dedup();
    widths
}

fn geometric(original: u32, step: f64, min_width: u32, max_variants: usize) -> Vec<u32> {
    let mut selected = vec![original];
    if !(step > 1.0) {
        return selected;
    }
    let mut current = original as f64;
    while selected.len() < max_variants.max(1) {
        current /= step;
        let width = current.floor() as u32;
        if width == 0 || width < min_width {
            break;
        }
        selected.push(width);
    }
    selected
}
