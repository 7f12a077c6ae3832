//! Raw record validation and normalization.
//!
//! Everything in here is a pure function of its input plus the loaded rule tables: no clock, no
//! randomness, no I/O after construction. Feeding the same raw record twice yields byte-identical
//! output.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use jobtrend_core::{
    collapse_whitespace, fold_key, CanonicalLocation, Cleaned, CleanedRecord, CompanyName,
    PostingStatus, RawPosting, RawRecord, RejectedRecord, ValidationError,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillRule {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Phrases blanked out before matching this skill, e.g. `Go-Live` for `Go`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignore: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SkillRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    skills: Vec<SkillRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CityRule {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
struct LocationRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    country_names: Vec<String>,
    #[serde(default)]
    cities: Vec<CityRule>,
}

const DEFAULT_SKILLS: &[(&str, &[&str], &[&str])] = &[
    (".NET", &["dotnet"], &[]),
    ("ABAP", &[], &[]),
    ("Android", &[], &[]),
    ("Angular", &[], &[]),
    ("AWS", &[], &[]),
    ("C#", &[], &[]),
    ("C++", &[], &[]),
    ("Clojure", &[], &[]),
    ("COBOL", &[], &[]),
    ("Delphi", &[], &[]),
    ("Flutter", &[], &[]),
    ("Go", &["Golang"], &["Go-Live", "Go Live", "Go-to-Market"]),
    ("iOS", &[], &[]),
    ("Java", &[], &[]),
    ("JavaScript", &[], &[]),
    ("Kotlin", &[], &[]),
    ("NodeJS", &["Node.js"], &[]),
    ("PHP", &[], &[]),
    ("PL/SQL", &[], &[]),
    ("Python", &[], &[]),
    ("RPG", &[], &[]),
    ("Ruby", &[], &[]),
    ("Rust", &[], &[]),
    ("SAP", &[], &[]),
    ("Scala", &[], &[]),
    ("SQL", &[], &[]),
    ("TypeScript", &[], &[]),
    ("VHDL", &[], &[]),
];

const DEFAULT_COUNTRIES: &[&str] = &["Deutschland", "Germany", "DE"];

const DEFAULT_CITIES: &[(&str, &[&str], f64, f64)] = &[
    ("Aachen", &[], 50.7753, 6.0839),
    ("Berlin", &[], 52.5200, 13.4050),
    ("Bonn", &[], 50.7374, 7.0982),
    ("Bremen", &[], 53.0793, 8.8017),
    ("Dortmund", &[], 51.5136, 7.4653),
    ("Dresden", &[], 51.0504, 13.7373),
    ("Düsseldorf", &["Duesseldorf", "Dusseldorf"], 51.2277, 6.7735),
    ("Essen", &[], 51.4556, 7.0116),
    ("Frankfurt am Main", &["Frankfurt", "Frankfurt a.M."], 50.1109, 8.6821),
    ("Hamburg", &[], 53.5511, 9.9937),
    ("Hannover", &["Hanover"], 52.3759, 9.7320),
    ("Karlsruhe", &[], 49.0069, 8.4037),
    ("Köln", &["Koeln", "Cologne"], 50.9375, 6.9603),
    ("Leipzig", &[], 51.3397, 12.3731),
    ("Mannheim", &[], 49.4875, 8.4660),
    ("München", &["Muenchen", "Munich"], 48.1351, 11.5820),
    ("Münster", &["Muenster"], 51.9607, 7.6261),
    ("Nürnberg", &["Nuernberg", "Nuremberg"], 49.4521, 11.0767),
    ("Stuttgart", &[], 48.7758, 9.1829),
];

#[derive(Debug, Clone)]
struct SkillPattern {
    name: String,
    needle: Regex,
    ignore: Option<Regex>,
}

/// Case-insensitive, word-bounded matcher over a fixed skill vocabulary.
#[derive(Debug, Clone)]
pub struct SkillMatcher {
    patterns: Vec<SkillPattern>,
}

impl SkillMatcher {
    pub fn new(rules: &[SkillRule]) -> Result<Self> {
        let mut patterns = Vec::new();
        for rule in rules {
            let ignore = ignore_pattern(&rule.ignore)
                .with_context(|| format!("compiling ignore phrases for {:?}", rule.name))?;
            for needle in std::iter::once(&rule.name).chain(rule.aliases.iter()) {
                let needle = collapse_whitespace(needle);
                if needle.is_empty() {
                    continue;
                }
                let regex = Regex::new(&needle_pattern(&needle))
                    .with_context(|| format!("compiling skill pattern for {needle:?}"))?;
                patterns.push(SkillPattern {
                    name: rule.name.clone(),
                    needle: regex,
                    ignore: ignore.clone(),
                });
            }
        }
        Ok(Self { patterns })
    }

    pub fn builtin() -> Result<Self> {
        Self::new(&default_skill_rules())
    }

    /// Canonical skill names mentioned in `text`, sorted and unique.
    pub fn extract(&self, text: &str) -> Vec<String> {
        let found: BTreeSet<&str> = self
            .patterns
            .iter()
            .filter(|p| match &p.ignore {
                Some(ignore) => p.needle.is_match(&ignore.replace_all(text, " ")),
                None => p.needle.is_match(text),
            })
            .map(|p| p.name.as_str())
            .collect();
        found.into_iter().map(ToString::to_string).collect()
    }
}

/// A letter or digit next to an alphanumeric edge of the needle breaks the match, so "Java"
/// stays out of "JavaScript". Punctuation edges need no boundary: ".NET" is found in "ASP.NET"
/// and "C++," still matches.
fn needle_pattern(needle: &str) -> String {
    const EDGE: &str = r"[^\p{L}\p{N}]";
    let lead = if needle.starts_with(char::is_alphanumeric) {
        format!("(?:^|{EDGE})")
    } else {
        String::new()
    };
    let trail = if needle.ends_with(char::is_alphanumeric) {
        format!("(?:$|{EDGE})")
    } else {
        String::new()
    };
    format!("(?i){lead}{}{trail}", regex::escape(needle))
}

fn ignore_pattern(phrases: &[String]) -> Result<Option<Regex>> {
    let alternatives: Vec<String> = phrases
        .iter()
        .map(|p| collapse_whitespace(p))
        .filter(|p| !p.is_empty())
        .map(|p| regex::escape(&p))
        .collect();
    if alternatives.is_empty() {
        return Ok(None);
    }
    Ok(Some(Regex::new(&format!("(?i){}", alternatives.join("|")))?))
}

#[derive(Debug, Clone, PartialEq)]
struct CityEntry {
    name: String,
    latitude: Option<f64>,
    longitude: Option<f64>,
}

/// Canonical city lookup keyed by folded names and aliases.
#[derive(Debug, Clone)]
pub struct LocationTable {
    by_key: BTreeMap<String, CityEntry>,
    countries: HashSet<String>,
    fuzzy_threshold: Option<f64>,
}

impl LocationTable {
    pub fn new(cities: &[CityRule], country_names: &[String]) -> Self {
        let mut by_key = BTreeMap::new();
        for city in cities {
            let entry = CityEntry {
                name: collapse_whitespace(&city.name),
                latitude: city.latitude,
                longitude: city.longitude,
            };
            for name in std::iter::once(&city.name).chain(city.aliases.iter()) {
                by_key.insert(fold_key(name), entry.clone());
            }
        }
        Self {
            by_key,
            countries: country_names.iter().map(|c| fold_key(c)).collect(),
            fuzzy_threshold: None,
        }
    }

    pub fn builtin() -> Self {
        let countries = DEFAULT_COUNTRIES
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        Self::new(&default_city_rules(), &countries)
    }

    /// Accept the closest Jaro-Winkler key at or above `threshold` when the exact lookup misses.
    pub fn with_fuzzy_threshold(mut self, threshold: f64) -> Self {
        self.fuzzy_threshold = Some(threshold.clamp(0.0, 1.0));
        self
    }

    /// Comma-separated segments are tried right to left, so both `"District, City"` and
    /// `"City, State"` resolve. Segments left of the matched city are kept as the district.
    pub fn resolve(&self, raw: Option<&str>) -> CanonicalLocation {
        let Some(raw) = raw else {
            return CanonicalLocation::unknown();
        };
        let keys: Vec<(String, String)> = raw
            .split(',')
            .map(collapse_whitespace)
            .filter(|p| !p.is_empty())
            .map(|p| (fold_key(&p), p))
            .filter(|(key, _)| !self.countries.contains(key))
            .collect();

        let found = (0..keys.len())
            .rev()
            .find_map(|idx| self.by_key.get(&keys[idx].0).map(|e| (idx, e)))
            .or_else(|| {
                (0..keys.len())
                    .rev()
                    .find_map(|idx| self.fuzzy_lookup(&keys[idx].0).map(|e| (idx, e)))
            });
        let Some((idx, entry)) = found else {
            debug!(location = raw, "location not in lookup table");
            return CanonicalLocation::unknown();
        };

        let district: Vec<&str> = keys[..idx].iter().map(|(_, p)| p.as_str()).collect();
        CanonicalLocation {
            name: entry.name.clone(),
            district: (!district.is_empty()).then(|| district.join(", ")),
            latitude: entry.latitude,
            longitude: entry.longitude,
        }
    }

    fn fuzzy_lookup(&self, key: &str) -> Option<&CityEntry> {
        let threshold = self.fuzzy_threshold?;
        let mut best: Option<(f64, &CityEntry)> = None;
        for (candidate, entry) in &self.by_key {
            let score = jaro_winkler(key, candidate);
            // Strictly greater keeps the first key in sorted order on ties.
            if score >= threshold && best.map_or(true, |(s, _)| score > s) {
                best = Some((score, entry));
            }
        }
        best.map(|(_, entry)| entry)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleaningOutcome {
    pub accepted: Vec<CleanedRecord>,
    pub rejected: Vec<RejectedRecord>,
    /// Accepted records dropped because a later record in the batch had the same external id.
    pub duplicates: usize,
}

#[derive(Debug, Clone)]
pub struct CleaningEngine {
    skills: SkillMatcher,
    locations: LocationTable,
}

impl CleaningEngine {
    pub fn new(skills: SkillMatcher, locations: LocationTable) -> Self {
        Self { skills, locations }
    }

    pub fn builtin() -> Result<Self> {
        Ok(Self::new(SkillMatcher::builtin()?, LocationTable::builtin()))
    }

    /// Load `rules/skills.yaml` and `rules/locations.yaml`; a missing file falls back to the
    /// built-in table, a broken one is an error.
    pub fn from_rules_dir(rules_dir: &Path) -> Result<Self> {
        let skill_rules = match read_optional(&rules_dir.join("skills.yaml"))? {
            Some(text) => {
                let file: SkillRulesFile =
                    serde_yaml::from_str(&text).context("parsing rules/skills.yaml")?;
                file.skills
            }
            None => default_skill_rules(),
        };
        let locations = match read_optional(&rules_dir.join("locations.yaml"))? {
            Some(text) => {
                let file: LocationRulesFile =
                    serde_yaml::from_str(&text).context("parsing rules/locations.yaml")?;
                LocationTable::new(&file.cities, &file.country_names)
            }
            None => LocationTable::builtin(),
        };
        Ok(Self::new(SkillMatcher::new(&skill_rules)?, locations))
    }

    pub fn clean(&self, record: &RawRecord) -> Cleaned {
        match record {
            RawRecord::Malformed {
                source_id,
                page,
                reason,
                ..
            } => Cleaned::Rejected(RejectedRecord {
                source_id: source_id.clone(),
                page: *page,
                external_id: None,
                reason: ValidationError::Malformed {
                    reason: reason.clone(),
                },
            }),
            RawRecord::Posting(raw) => match self.clean_posting(raw) {
                Ok(cleaned) => Cleaned::Accepted(cleaned),
                Err(reason) => Cleaned::Rejected(RejectedRecord {
                    source_id: raw.source_id.clone(),
                    page: raw.page,
                    external_id: non_empty(raw.external_id.as_deref()),
                    reason,
                }),
            },
        }
    }

    /// Clean a whole page. Repeated external ids collapse to their last occurrence.
    pub fn clean_batch(&self, records: &[RawRecord]) -> CleaningOutcome {
        let mut accepted = Vec::new();
        let mut rejected = Vec::new();
        for record in records {
            match self.clean(record) {
                Cleaned::Accepted(cleaned) => accepted.push(cleaned),
                Cleaned::Rejected(rejection) => rejected.push(rejection),
            }
        }

        let last_seen: HashMap<&str, usize> = accepted
            .iter()
            .enumerate()
            .map(|(idx, rec)| (rec.external_id.as_str(), idx))
            .collect();
        let keep: Vec<bool> = accepted
            .iter()
            .enumerate()
            .map(|(idx, rec)| last_seen.get(rec.external_id.as_str()) == Some(&idx))
            .collect();
        let before = accepted.len();
        let mut flags = keep.into_iter();
        accepted.retain(|_| flags.next().unwrap_or(false));

        CleaningOutcome {
            duplicates: before - accepted.len(),
            accepted,
            rejected,
        }
    }

    fn clean_posting(&self, raw: &RawPosting) -> Result<CleanedRecord, ValidationError> {
        let external_id = non_empty(raw.external_id.as_deref())
            .map(|id| id.trim().to_string())
            .ok_or_else(|| ValidationError::missing("external_id"))?;
        let title = non_empty(raw.title.as_deref())
            .map(|t| collapse_whitespace(&t))
            .ok_or_else(|| ValidationError::missing("title"))?;
        let status = match non_empty(raw.status.as_deref()) {
            Some(status) => status.parse::<PostingStatus>()?,
            None => PostingStatus::Active,
        };
        let posted_on = parse_posted_on(raw.posted_at.as_deref(), raw.fetched_at)?;
        let posted_on_estimated = non_empty(raw.posted_at.as_deref()).is_none();
        let description = raw
            .description
            .as_deref()
            .map(collapse_whitespace)
            .unwrap_or_default();

        let company = non_empty(raw.company.as_deref()).map(|name| CompanyName {
            key: fold_key(&name),
            display: collapse_whitespace(&name),
            industry: non_empty(raw.company_industry.as_deref()).map(|i| collapse_whitespace(&i)),
        });

        let (latitude, longitude) = match (raw.latitude, raw.longitude) {
            (Some(lat), Some(lon))
                if (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon) =>
            {
                (Some(lat), Some(lon))
            }
            _ => (None, None),
        };

        let skills = self.skills.extract(&format!("{title}\n{description}"));

        Ok(CleanedRecord {
            external_id,
            source_id: raw.source_id.clone(),
            location: self.locations.resolve(raw.location.as_deref()),
            title,
            description,
            company,
            latitude,
            longitude,
            posted_on,
            posted_on_estimated,
            retrieved_at: raw.fetched_at,
            industry: non_empty(raw.industry.as_deref()).map(|i| collapse_whitespace(&i)),
            status,
            skills,
            redirect_url: non_empty(raw.redirect_url.as_deref()).map(|u| u.trim().to_string()),
            salary_is_predicted: raw.salary_is_predicted.unwrap_or(false),
        })
    }
}

/// RFC 3339 or bare `YYYY-MM-DD`; absent falls back to the retrieval date.
pub fn parse_posted_on(
    value: Option<&str>,
    fetched_at: DateTime<Utc>,
) -> Result<NaiveDate, ValidationError> {
    let Some(value) = non_empty(value) else {
        return Ok(fetched_at.date_naive());
    };
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc).date_naive());
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|_| ValidationError::InvalidField {
        field: "posted_at".to_string(),
        value: value.to_string(),
    })
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .filter(|v| !v.trim().is_empty())
        .map(ToString::to_string)
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
    }
}

pub fn default_skill_rules() -> Vec<SkillRule> {
    DEFAULT_SKILLS
        .iter()
        .map(|(name, aliases, ignore)| SkillRule {
            name: name.to_string(),
            aliases: aliases.iter().map(ToString::to_string).collect(),
            ignore: ignore.iter().map(ToString::to_string).collect(),
        })
        .collect()
}

pub fn default_city_rules() -> Vec<CityRule> {
    DEFAULT_CITIES
        .iter()
        .map(|(name, aliases, lat, lon)| CityRule {
            name: name.to_string(),
            aliases: aliases.iter().map(ToString::to_string).collect(),
            latitude: Some(*lat),
            longitude: Some(*lon),
        })
        .collect()
}
