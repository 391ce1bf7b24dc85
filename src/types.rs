use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Parameter name to normalized value in `[0, 1]`
pub type ParameterState = BTreeMap<String, f64>;

/// sACN universe number
pub type UniverseId = u16;

/// DMX channel, 1-indexed
pub type Channel = u16;

/// Milliseconds since the Unix epoch
pub type Timestamp = i64;

/// Number of DMX channels in a universe
pub const UNIVERSE_SIZE: usize = 512;

/// Where a named parameter lands on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterMapping {
    pub universe: UniverseId,

    /// 1-indexed DMX channel; anything outside `1..=512` is ignored at dispatch
    pub channel: Channel,
}

impl ParameterMapping {
    /// Zero-based slot in the universe frame, if the channel is addressable
    pub fn slot(&self) -> Option<usize> {
        let channel = usize::from(self.channel);
        (1..=UNIVERSE_SIZE).contains(&channel).then(|| channel - 1)
    }
}

/// Universe metadata
///
/// The address is kept for the UI and round-trips through the mapping file,
/// but frames are always sent to the universe's multicast group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniverseConfig {
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub label: String,
}

/// Universe and parameter mapping
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Universe number (as a string key) to metadata
    #[serde(default)]
    pub universes: BTreeMap<String, UniverseConfig>,

    /// Parameter name to universe/channel
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterMapping>,
}

impl Config {
    /// Look up the mapping for a parameter
    pub fn mapping(&self, parameter: &str) -> Option<ParameterMapping> {
        self.parameters.get(parameter).copied()
    }
}

/// Administrative mapping update; absent sections are left untouched
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub universes: Option<BTreeMap<String, UniverseConfig>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<BTreeMap<String, ParameterMapping>>,
}
