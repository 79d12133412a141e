use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Player statistic a proposition is written against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PropType {
    Points,
    Rebounds,
    Assists,
    Threes,
    MadeThrees,
    Steals,
    Blocks,
}

impl PropType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PropType::Points => "Points",
            PropType::Rebounds => "Rebounds",
            PropType::Assists => "Assists",
            PropType::Threes => "Threes",
            PropType::MadeThrees => "Made Threes",
            PropType::Steals => "Steals",
            PropType::Blocks => "Blocks",
        }
    }
}

impl fmt::Display for PropType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PropType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "points" => Ok(PropType::Points),
            "rebounds" => Ok(PropType::Rebounds),
            "assists" => Ok(PropType::Assists),
            "threes" => Ok(PropType::Threes),
            "made threes" => Ok(PropType::MadeThrees),
            "steals" => Ok(PropType::Steals),
            "blocks" => Ok(PropType::Blocks),
            other => Err(format!("unknown prop type: {other}")),
        }
    }
}

impl TryFrom<String> for PropType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PropType> for String {
    fn from(value: PropType) -> Self {
        value.as_str().to_string()
    }
}

/// Which side of the line a proposition takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Side {
    Over,
    Under,
    Unknown,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Over => "Over",
            Side::Under => "Under",
            Side::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for Side {
    fn from(value: String) -> Self {
        match value.trim().to_lowercase().as_str() {
            "over" => Side::Over,
            "under" => Side::Under,
            _ => Side::Unknown,
        }
    }
}

impl From<Side> for String {
    fn from(value: Side) -> Self {
        value.as_str().to_string()
    }
}

/// American-format odds as posted by the book, or the "no line" sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AmericanOdds {
    Line(i32),
    #[default]
    Off,
}

impl AmericanOdds {
    /// Parse vendor text: "-110", "+150", "OFF", "" ...
    pub fn parse(raw: &str) -> Self {
        raw.trim()
            .trim_start_matches('+')
            .parse::<i32>()
            .map(AmericanOdds::Line)
            .unwrap_or(AmericanOdds::Off)
    }

    pub fn value(&self) -> Option<i32> {
        match self {
            AmericanOdds::Line(v) => Some(*v),
            AmericanOdds::Off => None,
        }
    }
}

impl fmt::Display for AmericanOdds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AmericanOdds::Line(v) if *v > 0 => write!(f, "+{v}"),
            AmericanOdds::Line(v) => write!(f, "{v}"),
            AmericanOdds::Off => f.write_str("OFF"),
        }
    }
}

impl Serialize for AmericanOdds {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            AmericanOdds::Line(v) => serializer.serialize_i32(*v),
            AmericanOdds::Off => serializer.serialize_str("OFF"),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawOdds {
    Int(i64),
    Float(f64),
    Text(String),
}

impl<'de> Deserialize<'de> for AmericanOdds {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let odds = match Option::<RawOdds>::deserialize(deserializer)? {
            Some(RawOdds::Int(v)) => i32::try_from(v)
                .map(AmericanOdds::Line)
                .unwrap_or(AmericanOdds::Off),
            Some(RawOdds::Float(v)) if v.is_finite() && v.fract() == 0.0 => {
                AmericanOdds::Line(v as i32)
            }
            Some(RawOdds::Float(_)) => AmericanOdds::Off,
            Some(RawOdds::Text(s)) => AmericanOdds::parse(&s),
            None => AmericanOdds::Off,
        };
        Ok(odds)
    }
}

/// One historical game for one player.
///
/// `stats` holds every numeric column the historical store carries for the
/// game: raw box-score stats, precomputed `feat_*` columns, `target_*` proxy
/// labels and anything else numeric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameRecord {
    pub player: String,
    pub game_date: NaiveDate,
    pub stats: BTreeMap<String, f64>,
}

impl GameRecord {
    /// Finite value of a column, if present.
    pub fn value(&self, column: &str) -> Option<f64> {
        self.stats.get(column).copied().filter(|v| v.is_finite())
    }
}

/// A player's game log as read from the historical store (any order).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GameLog {
    pub player: String,
    pub games: Vec<GameRecord>,
}

impl GameLog {
    pub fn new(player: impl Into<String>, games: Vec<GameRecord>) -> Self {
        Self {
            player: player.into(),
            games,
        }
    }

    pub fn len(&self) -> usize {
        self.games.len()
    }

    pub fn is_empty(&self) -> bool {
        self.games.is_empty()
    }

    /// Union of all column names across games.
    pub fn columns(&self) -> BTreeSet<String> {
        self.games
            .iter()
            .flat_map(|g| g.stats.keys().cloned())
            .collect()
    }

    /// Games in ascending date order. Stable, so same-day rows keep input order.
    pub fn chronological(&self) -> Vec<&GameRecord> {
        let mut games: Vec<&GameRecord> = self.games.iter().collect();
        games.sort_by_key(|g| g.game_date);
        games
    }
}

/// A proposition discovered on the live market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropCandidate {
    #[serde(rename = "Player")]
    pub player: String,
    #[serde(rename = "Prop")]
    pub prop: PropType,
    #[serde(rename = "Line")]
    pub line: f64,
    #[serde(rename = "Over/Under")]
    pub side: Side,
    #[serde(rename = "Odds", default)]
    pub odds: AmericanOdds,
    /// Date of the game the prop is for; required later for outcome tracking.
    #[serde(default)]
    pub game_date: Option<NaiveDate>,
}

/// The ranked output record for one processed proposition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropPrediction {
    pub id: Option<i64>,
    pub player: String,
    pub prop: PropType,
    pub line: f64,
    pub side: Side,
    pub odds: AmericanOdds,
    pub decimal_odds: f64,
    pub implied_probability: f64,
    pub model_probability: f64,
    pub probability_ci_lower: f64,
    pub probability_ci_upper: f64,
    /// model probability − implied probability
    pub edge: f64,
    pub expected_value: f64,
    pub ev_ci_lower: f64,
    pub ev_ci_upper: f64,
    pub kelly_fraction: f64,
    /// Ranking key: EV · clamp(kelly, 0, 1)^1.5
    pub kelly_adjusted_ev: f64,
    /// Data-quality proxy in [0, 1]
    pub confidence_score: f64,
    pub historical_games: i64,
    pub training_samples: i64,
    pub game_date: Option<NaiveDate>,
    pub generated_at: DateTime<Utc>,
}

/// Realized result of a stored prediction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedOutcome {
    pub id: Option<i64>,
    pub prediction_id: i64,
    pub player: String,
    pub prop: PropType,
    pub line: f64,
    pub side: Side,
    pub odds: AmericanOdds,
    pub model_probability: Option<f64>,
    pub expected_value: Option<f64>,
    pub actual_value: f64,
    /// `None` = push (actual landed exactly on the line)
    pub outcome: Option<bool>,
    pub profit_loss: Option<f64>,
    pub game_date: NaiveDate,
    pub result_date: NaiveDate,
}
