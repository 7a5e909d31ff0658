use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Claude,
    Gemini,
    Codex,
}

impl RuntimeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RuntimeKind::Claude => "claude",
            RuntimeKind::Gemini => "gemini",
            RuntimeKind::Codex => "codex",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "claude" => Some(RuntimeKind::Claude),
            "gemini" => Some(RuntimeKind::Gemini),
            "codex" => Some(RuntimeKind::Codex),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trips_as_str() {
        for kind in [RuntimeKind::Claude, RuntimeKind::Gemini, RuntimeKind::Codex] {
            assert_eq!(RuntimeKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn parse_rejects_unknown() {
        assert_eq!(RuntimeKind::parse("not-a-runtime"), None);
    }
}
