//! Answer tone presets interpolated into the system prompt.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Persona {
    #[default]
    StrictFormal,
    Educational,
    RiskFocused,
    Concise,
}

impl Persona {
    pub const ALL: [Persona; 4] = [
        Persona::StrictFormal,
        Persona::Educational,
        Persona::RiskFocused,
        Persona::Concise,
    ];

    /// Tone instruction placed at the top of the system prompt.
    pub fn instruction(self) -> &'static str {
        match self {
            Persona::StrictFormal => {
                "Adopt a formal, authoritative tone. Focus strictly on regulatory text compliance."
            }
            Persona::Educational => {
                "Adopt a helpful, teaching tone. Explain the 'why' behind regulations. Be patient and clear."
            }
            Persona::RiskFocused => {
                "Prioritize risk assessment. Highlight potential penalties, gaps, and worst-case scenarios first."
            }
            Persona::Concise => {
                "Be extremely brief and to the point. Use bullet points. Avoid all unnecessary words."
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Persona::StrictFormal => "strict_formal",
            Persona::Educational => "educational",
            Persona::RiskFocused => "risk_focused",
            Persona::Concise => "concise",
        }
    }
}

impl std::str::FromStr for Persona {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "strict_formal" | "formal" => Ok(Persona::StrictFormal),
            "educational" => Ok(Persona::Educational),
            "risk_focused" | "risk" => Ok(Persona::RiskFocused),
            "concise" => Ok(Persona::Concise),
            _ => Err(format!("unknown persona: {}", s)),
        }
    }
}

impl std::fmt::Display for Persona {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persona_from_str() {
        assert_eq!("strict_formal".parse::<Persona>(), Ok(Persona::StrictFormal));
        assert_eq!("Risk-Focused".parse::<Persona>(), Ok(Persona::RiskFocused));
        assert_eq!("concise".parse::<Persona>(), Ok(Persona::Concise));
        assert!("pirate".parse::<Persona>().is_err());
    }

    #[test]
    fn test_persona_round_trips_through_display() {
        for persona in Persona::ALL {
            assert_eq!(persona.to_string().parse::<Persona>(), Ok(persona));
        }
    }

    #[test]
    fn test_default_persona_is_formal() {
        assert!(Persona::default().instruction().contains("formal"));
    }
}
