use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Admission priority. Higher levels are serviced first when callers wait for a slot.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum PriorityLevel {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl PriorityLevel {
    /// All levels, lowest first.
    pub const ALL: [PriorityLevel; 4] = [
        PriorityLevel::Low,
        PriorityLevel::Normal,
        PriorityLevel::High,
        PriorityLevel::Critical,
    ];

    pub const COUNT: usize = 4;

    pub fn name(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Dense index, `Low == 0`.
    #[inline]
    pub(crate) fn index(&self) -> usize {
        match self {
            Self::Low => 0,
            Self::Normal => 1,
            Self::High => 2,
            Self::Critical => 3,
        }
    }
}

impl fmt::Display for PriorityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PriorityLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

/// Per-priority waiter counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityDepths {
    pub low: usize,
    pub normal: usize,
    pub high: usize,
    pub critical: usize,
}

impl PriorityDepths {
    pub fn from_array(counts: [usize; PriorityLevel::COUNT]) -> Self {
        Self {
            low: counts[0],
            normal: counts[1],
            high: counts[2],
            critical: counts[3],
        }
    }

    pub fn get(&self, priority: PriorityLevel) -> usize {
        match priority {
            PriorityLevel::Low => self.low,
            PriorityLevel::Normal => self.normal,
            PriorityLevel::High => self.high,
            PriorityLevel::Critical => self.critical,
        }
    }

    pub fn total(&self) -> usize {
        self.low + self.normal + self.high + self.critical
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_is_ascending() {
        assert!(PriorityLevel::Critical > PriorityLevel::High);
        assert!(PriorityLevel::High > PriorityLevel::Normal);
        assert!(PriorityLevel::Normal > PriorityLevel::Low);
        assert_eq!(PriorityLevel::default(), PriorityLevel::Normal);
    }

    #[test]
    fn test_parse() {
        assert_eq!("HIGH".parse::<PriorityLevel>(), Ok(PriorityLevel::High));
        assert_eq!(" low ".parse::<PriorityLevel>(), Ok(PriorityLevel::Low));
        assert!("urgent".parse::<PriorityLevel>().is_err());
    }

    #[test]
    fn test_index_matches_all() {
        for (i, p) in PriorityLevel::ALL.iter().enumerate() {
            assert_eq!(p.index(), i);
        }
    }

    #[test]
    fn test_depths() {
        let d = PriorityDepths::from_array([1, 0, 2, 3]);
        assert_eq!(d.get(PriorityLevel::Critical), 3);
        assert_eq!(d.total(), 6);
    }
}
