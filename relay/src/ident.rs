//! Identifier scheme.
//!
//! Every artifact location is a pure function of the transfer code, the publish date and, for chunks, the chunk index:
//!
//! ```text
//!     coordinator  {prefix}      {YYYY}.{MM}.{DD}-{code}
//!     chunk N      {prefix}-sub  {YYYY}.{MM}.{DD}-{code}.{NNNN}
//! ```
//!
//! No registry state is needed to know _where_ to look for an artifact, only _whether_ it exists yet.

use std::fmt;
use std::str::FromStr;

use chrono::{Days, NaiveDate};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default artifact name prefix.
pub const DEFAULT_PREFIX: &str = "relay-core-part";

const CODE_LEN: usize = 4;
const INDEX_WIDTH: usize = 4;
/// Maximum number of chunks of one transfer.
pub const MAX_CHUNKS: usize = 10_usize.pow(INDEX_WIDTH as u32);
const CHUNK_SUFFIX: &str = "-sub";
const DATE_FORMAT: &str = "%Y.%m.%d";

/// A short human-typeable transfer code made of 4 decimal digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TransferCode(String);

impl TransferCode {
    /// Draw a random code in `1000..=9999`.
    pub fn generate() -> Self {
        Self(rand::thread_rng().gen_range(1_000..10_000).to_string())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for TransferCode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() == CODE_LEN && s.bytes().all(|b| b.is_ascii_digit()) {
            Ok(Self(s.to_owned()))
        } else {
            Err(Error::InvalidCode(s.to_owned()))
        }
    }
}

impl TryFrom<String> for TransferCode {
    type Error = Error;

    #[inline]
    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<TransferCode> for String {
    #[inline]
    fn from(code: TransferCode) -> Self {
        code.0
    }
}

impl fmt::Display for TransferCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Registry coordinates of one artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactId {
    pub name: String,
    pub version: String,
}

impl ArtifactId {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// Maps transfer codes to artifact identities and back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scheme {
    coordinator: String,
    chunk: String,
}

impl Default for Scheme {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

impl Scheme {
    pub fn new(prefix: impl Into<String>) -> Self {
        let coordinator = prefix.into();
        let chunk = format!("{coordinator}{CHUNK_SUFFIX}");
        Self { coordinator, chunk }
    }

    /// Identity of the coordinator artifact of a transfer published on `date`.
    pub fn coordinator_id(&self, code: &TransferCode, date: NaiveDate) -> ArtifactId {
        ArtifactId::new(&self.coordinator, format!("{}-{code}", date.format(DATE_FORMAT)))
    }

    /// Coordinator identities of `code` from `today` back to `days` days before, most recent first.
    ///
    /// A transfer code is live as long as any of these slots holds a coordinator.
    pub fn coordinator_window<'a>(
        &'a self,
        code: &'a TransferCode,
        today: NaiveDate,
        days: u64,
    ) -> impl Iterator<Item = (NaiveDate, ArtifactId)> + 'a {
        (0..=days)
            .filter_map(move |n| today.checked_sub_days(Days::new(n)))
            .map(move |date| (date, self.coordinator_id(code, date)))
    }

    /// Identity of chunk `index` of a transfer published on `date`.
    ///
    /// The index is zero-padded to a fixed width so that versions sort lexically.
    pub fn chunk_id(&self, code: &TransferCode, index: usize, date: NaiveDate) -> Result<ArtifactId> {
        if index >= MAX_CHUNKS {
            return Err(Error::TooManyChunks(index));
        }

        Ok(ArtifactId::new(
            &self.chunk,
            format!("{}-{code}.{index:0width$}", date.format(DATE_FORMAT), width = INDEX_WIDTH),
        ))
    }

    /// Inverse of [`Scheme::coordinator_id()`].
    pub fn parse_coordinator(&self, id: &ArtifactId) -> Result<(NaiveDate, TransferCode)> {
        if id.name != self.coordinator {
            return Err(invalid(id));
        }

        let (date, code) = id.version.split_once('-').ok_or_else(|| invalid(id))?;

        Ok((parse_date(date).ok_or_else(|| invalid(id))?, code.parse()?))
    }

    /// Inverse of [`Scheme::chunk_id()`].
    pub fn parse_chunk(&self, id: &ArtifactId) -> Result<(NaiveDate, TransferCode, usize)> {
        if id.name != self.chunk {
            return Err(invalid(id));
        }

        let (date, rest) = id.version.split_once('-').ok_or_else(|| invalid(id))?;
        let (code, index) = rest.split_once('.').ok_or_else(|| invalid(id))?;

        if index.len() != INDEX_WIDTH || !index.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid(id));
        }

        Ok((
            parse_date(date).ok_or_else(|| invalid(id))?,
            code.parse()?,
            index.parse().map_err(|_| invalid(id))?,
        ))
    }
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    // enforce the zero-padded form, chrono alone accepts `2024.1.5`
    (s.len() == 10).then(|| NaiveDate::parse_from_str(s, DATE_FORMAT).ok()).flatten()
}

fn invalid(id: &ArtifactId) -> Error {
    Error::InvalidArtifactId(id.to_string())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn code(s: &str) -> TransferCode {
        s.parse().unwrap()
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 9).unwrap()
    }

    #[test]
    fn test_transfer_code_format() {
        assert_eq!(code("4821").as_str(), "4821");
        assert_eq!(code("0007").to_string(), "0007");

        for bad in ["", "482", "48210", "48a1", " 482", "４８２１"] {
            assert!(matches!(bad.parse::<TransferCode>(), Err(Error::InvalidCode(_))), "{bad:?}");
        }
    }

    #[test]
    fn test_transfer_code_generate() {
        for _ in 0..100 {
            let code = TransferCode::generate();
            let n: u32 = code.as_str().parse().unwrap();
            assert!((1_000..10_000).contains(&n));
        }
    }

    #[test]
    fn test_transfer_code_serde() {
        assert_eq!(serde_json::to_string(&code("4821")).unwrap(), r#""4821""#);
        assert_eq!(serde_json::from_str::<TransferCode>(r#""4821""#).unwrap(), code("4821"));
        assert!(serde_json::from_str::<TransferCode>(r#""48""#).is_err());
    }

    #[test]
    fn test_scenario_ids() {
        let scheme = Scheme::default();

        let coordinator = scheme.coordinator_id(&code("4821"), date());
        let chunk0 = scheme.chunk_id(&code("4821"), 0, date()).unwrap();
        let chunk1 = scheme.chunk_id(&code("4821"), 1, date()).unwrap();

        assert_eq!(coordinator, ArtifactId::new("relay-core-part", "2024.03.09-4821"));
        assert_eq!(chunk0, ArtifactId::new("relay-core-part-sub", "2024.03.09-4821.0000"));
        assert_eq!(chunk1, ArtifactId::new("relay-core-part-sub", "2024.03.09-4821.0001"));

        assert_ne!(coordinator, chunk0);
        assert_ne!(coordinator, chunk1);
        assert_ne!(chunk0, chunk1);
    }

    #[test]
    fn test_ids_deterministic() {
        let scheme = Scheme::new("pfx");

        assert_eq!(scheme.coordinator_id(&code("1234"), date()), scheme.coordinator_id(&code("1234"), date()));
        assert_eq!(scheme.chunk_id(&code("1234"), 7, date()).unwrap(), scheme.chunk_id(&code("1234"), 7, date()).unwrap());
    }

    #[test]
    fn test_ids_no_collisions() {
        let scheme = Scheme::default();
        let mut seen = HashSet::new();

        for c in (1_000..1_100).chain(9_950..10_000) {
            let code = code(&c.to_string());
            assert!(seen.insert(scheme.coordinator_id(&code, date())));
            for index in [0, 1, 9, 10, 99, 100, 9_999] {
                assert!(seen.insert(scheme.chunk_id(&code, index, date()).unwrap()));
            }
        }
    }

    #[test]
    fn test_chunk_versions_sort_lexically() {
        let scheme = Scheme::default();
        let versions: Vec<_> = (0..120).map(|i| scheme.chunk_id(&code("4821"), i, date()).unwrap().version).collect();

        let mut sorted = versions.clone();
        sorted.sort();
        assert_eq!(versions, sorted);
    }

    #[test]
    fn test_coordinator_window() {
        let scheme = Scheme::default();
        let window: Vec<_> = scheme.coordinator_window(&code("4821"), date(), 3).collect();

        let versions: Vec<_> = window.iter().map(|(_, id)| id.version.as_str()).collect();
        assert_eq!(versions, ["2024.03.09-4821", "2024.03.08-4821", "2024.03.07-4821", "2024.03.06-4821"]);
        assert!(window.iter().all(|(date, id)| scheme.parse_coordinator(id).unwrap() == (*date, code("4821"))));

        assert_eq!(scheme.coordinator_window(&code("4821"), date(), 0).count(), 1);
    }

    #[test]
    fn test_too_many_chunks() {
        let scheme = Scheme::default();

        assert!(scheme.chunk_id(&code("4821"), 9_999, date()).is_ok());
        assert!(matches!(scheme.chunk_id(&code("4821"), 10_000, date()), Err(Error::TooManyChunks(10_000))));
    }

    #[test]
    fn test_parse_inverse() {
        let scheme = Scheme::default();

        let id = scheme.coordinator_id(&code("4821"), date());
        assert_eq!(scheme.parse_coordinator(&id).unwrap(), (date(), code("4821")));

        let id = scheme.chunk_id(&code("0815"), 42, date()).unwrap();
        assert_eq!(scheme.parse_chunk(&id).unwrap(), (date(), code("0815"), 42));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        let scheme = Scheme::default();

        for id in [
            ArtifactId::new("other", "2024.03.09-4821"),
            ArtifactId::new("relay-core-part", "2024.03.09"),
            ArtifactId::new("relay-core-part", "2024.3.9-4821"),
            ArtifactId::new("relay-core-part", "2024.13.09-4821"),
        ] {
            assert!(scheme.parse_coordinator(&id).is_err(), "{id}");
        }

        assert!(matches!(
            scheme.parse_coordinator(&ArtifactId::new("relay-core-part", "2024.03.09-48")),
            Err(Error::InvalidCode(_))
        ));

        for id in [
            ArtifactId::new("relay-core-part", "2024.03.09-4821.0001"),
            ArtifactId::new("relay-core-part-sub", "2024.03.09-4821"),
            ArtifactId::new("relay-core-part-sub", "2024.03.09-4821.01"),
            ArtifactId::new("relay-core-part-sub", "2024.03.09-4821.00x1"),
        ] {
            assert!(scheme.parse_chunk(&id).is_err(), "{id}");
        }
    }
}
