use std::{fmt, str::FromStr};

use crate::Error;

#[derive(
    Clone, Copy, Debug, Default, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SortMode {
    /// Most liked first
    #[default]
    Best,
    Newest,
    Oldest,
}

impl SortMode {
    pub const ALL: [SortMode; 3] = [SortMode::Best, SortMode::Newest, SortMode::Oldest];

    pub fn name(&self) -> &'static str {
        match self {
            SortMode::Best => "best",
            SortMode::Newest => "newest",
            SortMode::Oldest => "oldest",
        }
    }
}

impl fmt::Display for SortMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SortMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<SortMode, Error> {
        SortMode::ALL
            .into_iter()
            .find(|m| m.name() == s)
            .ok_or_else(|| Error::Validation(format!("unknown sort mode {s:?}")))
    }
}
