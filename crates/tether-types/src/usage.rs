use serde::{Deserialize, Serialize};

/// Token counts reported by the agent for one turn.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

impl std::ops::AddAssign for Usage {
    fn add_assign(&mut self, other: Self) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Format a USD amount the way status replies show it.
pub fn format_usd(amount: f64) -> String {
    if amount < 0.01 && amount > 0.0 {
        format!("${amount:.4}")
    } else {
        format!("${amount:.2}")
    }
}
