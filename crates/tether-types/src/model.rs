use serde::{Deserialize, Serialize};

/// Models the agent CLI can be started with.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Model {
    Haiku,
    Sonnet,
    Opus,
}

impl Model {
    pub const ALL: [Model; 3] = [Model::Opus, Model::Sonnet, Model::Haiku];

    /// The name passed to the agent's `--model` flag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Haiku => "haiku",
            Self::Sonnet => "sonnet",
            Self::Opus => "opus",
        }
    }
}

impl std::fmt::Display for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Model {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "haiku" => Ok(Self::Haiku),
            "sonnet" => Ok(Self::Sonnet),
            "opus" => Ok(Self::Opus),
            other => Err(anyhow::anyhow!("unknown model: {other} (expected opus, sonnet or haiku)")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("Opus".parse::<Model>().unwrap(), Model::Opus);
        assert_eq!(" haiku ".parse::<Model>().unwrap(), Model::Haiku);
        assert!("gpt".parse::<Model>().is_err());
    }

    #[test]
    fn display_matches_cli_flag() {
        for model in Model::ALL {
            assert_eq!(model.to_string().parse::<Model>().unwrap(), model);
        }
    }
}
