//! Connection strategies.
//!
//! A connector decides which (pre, post) pairs get a synapse and with what
//! weight and delay. It only ever creates connections onto postsynaptic cells
//! owned by this node; [`ConnectionBuilder`] rejects anything else.

use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::population::Address;
use crate::projection::ConnectionBuilder;
use crate::random::RandomDistribution;
use crate::{Delay, PynnError, Result, Weight};

/// Constant or random weight/delay
#[derive(Debug)]
pub enum ConnectionValue {
    Constant(f64),
    Random(RandomDistribution),
}

impl ConnectionValue {
    pub fn next(&mut self) -> f64 {
        match self {
            Self::Constant(x) => *x,
            Self::Random(dist) => dist.next(),
        }
    }
}

impl Default for ConnectionValue {
    fn default() -> Self {
        Self::Constant(0.0)
    }
}

impl From<f64> for ConnectionValue {
    fn from(x: f64) -> Self {
        Self::Constant(x)
    }
}

impl From<RandomDistribution> for ConnectionValue {
    fn from(dist: RandomDistribution) -> Self {
        Self::Random(dist)
    }
}

impl fmt::Display for ConnectionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Constant(x) => write!(f, "{}", x),
            Self::Random(dist) => write!(f, "{}", dist),
        }
    }
}

/// Weight and delay sources shared by the generic connectors.
/// A missing delay means the simulation's minimum delay.
#[derive(Debug, Default)]
pub struct SynapseValues {
    pub weights: ConnectionValue,
    pub delays: Option<ConnectionValue>,
}

impl SynapseValues {
    pub fn new(weights: impl Into<ConnectionValue>, delays: Option<ConnectionValue>) -> Self {
        Self {
            weights: weights.into(),
            delays,
        }
    }

    fn next(&mut self, min_delay: Delay) -> (Weight, Delay) {
        let weight = self.weights.next();
        let delay = self.delays.as_mut().map_or(min_delay, ConnectionValue::next);
        (weight, delay)
    }

    fn describe(&self) -> String {
        match &self.delays {
            Some(d) => format!("weights={}, delays={}", self.weights, d),
            None => format!("weights={}, delays=min_delay", self.weights),
        }
    }
}

pub trait Connector {
    fn describe(&self) -> String;

    /// Create this strategy's connections through `builder`
    fn connect(&mut self, builder: &mut ConnectionBuilder<'_>) -> Result<()>;
}

/// Every presynaptic cell onto every postsynaptic cell
#[derive(Debug, Default)]
pub struct AllToAllConnector {
    pub allow_self_connections: bool,
    pub values: SynapseValues,
}

impl AllToAllConnector {
    pub fn new(allow_self_connections: bool, values: SynapseValues) -> Self {
        Self {
            allow_self_connections,
            values,
        }
    }
}

impl Connector for AllToAllConnector {
    fn describe(&self) -> String {
        format!(
            "AllToAllConnector(allow_self_connections={}, {})",
            self.allow_self_connections,
            self.values.describe()
        )
    }

    fn connect(&mut self, builder: &mut ConnectionBuilder<'_>) -> Result<()> {
        let (pre, post) = (builder.pre(), builder.post());
        for &target in post.local_cells() {
            for source in pre.all() {
                if !self.allow_self_connections && source == target {
                    continue;
                }
                let (w, d) = self.values.next(builder.min_delay());
                builder.connect(source, target, w, d)?;
            }
        }
        Ok(())
    }
}

/// Cell `i` of the presynaptic population onto cell `i` of the postsynaptic one
#[derive(Debug, Default)]
pub struct OneToOneConnector {
    pub values: SynapseValues,
}

impl OneToOneConnector {
    pub fn new(values: SynapseValues) -> Self {
        Self { values }
    }
}

impl Connector for OneToOneConnector {
    fn describe(&self) -> String {
        format!("OneToOneConnector({})", self.values.describe())
    }

    fn connect(&mut self, builder: &mut ConnectionBuilder<'_>) -> Result<()> {
        let (pre, post) = (builder.pre(), builder.post());
        if pre.size() != post.size() {
            return Err(PynnError::InvalidDimensions(format!(
                "one-to-one needs populations of equal size, got {} and {}",
                pre.size(),
                post.size()
            )));
        }
        for &target in post.local_cells() {
            let i = post
                .layout()
                .offset(target)
                .ok_or_else(|| PynnError::IndexError(target.to_string()))?;
            let source = pre.index(i)?;
            let (w, d) = self.values.next(builder.min_delay());
            builder.connect(source, target, w, d)?;
        }
        Ok(())
    }
}

/// Each pair kept independently with probability `p`
#[derive(Debug)]
pub struct FixedProbabilityConnector {
    pub p: f64,
    pub allow_self_connections: bool,
    pub values: SynapseValues,
}

impl FixedProbabilityConnector {
    pub fn new(p: f64, allow_self_connections: bool, values: SynapseValues) -> Result<Self> {
        if !(0.0..=1.0).contains(&p) {
            return Err(PynnError::InvalidArgument(format!(
                "connection probability must be in [0, 1], got {}",
                p
            )));
        }
        Ok(Self {
            p,
            allow_self_connections,
            values,
        })
    }
}

impl Connector for FixedProbabilityConnector {
    fn describe(&self) -> String {
        format!(
            "FixedProbabilityConnector(p={}, allow_self_connections={}, {})",
            self.p,
            self.allow_self_connections,
            self.values.describe()
        )
    }

    fn connect(&mut self, builder: &mut ConnectionBuilder<'_>) -> Result<()> {
        let (pre, post) = (builder.pre(), builder.post());
        let sources: Vec<_> = pre.all().collect();
        // Draw for every target so all nodes walk the stream the same way.
        for target in post.all() {
            let draws = builder.rng().uniform(sources.len());
            if !post.is_local(target) {
                continue;
            }
            for (&source, r) in sources.iter().zip(draws) {
                if r >= self.p || (!self.allow_self_connections && source == target) {
                    continue;
                }
                let (w, d) = self.values.next(builder.min_delay());
                builder.connect(source, target, w, d)?;
            }
        }
        Ok(())
    }
}

/// One line of a saved connection file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub pre: Address,
    pub post: Address,
    pub weight: Weight,
    pub delay: Delay,
}

impl ConnectionRecord {
    /// `pre_label[addr]\tpost_label[addr]\tweight\tdelay`
    pub fn to_line(&self, pre_label: &str, post_label: &str) -> String {
        format!(
            "{}{}\t{}{}\t{}\t{}",
            pre_label, self.pre, post_label, self.post, self.weight, self.delay
        )
    }

    /// Parse one line; population labels are ignored
    pub fn parse_line(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split('\t').collect();
        let [pre, post, weight, delay] = fields.as_slice() else {
            return Err(PynnError::Parse(format!(
                "expected 4 tab-separated fields, got {}",
                fields.len()
            )));
        };
        Ok(Self {
            pre: parse_labelled_address(pre)?,
            post: parse_labelled_address(post)?,
            weight: parse_number(weight)?,
            delay: parse_number(delay)?,
        })
    }
}

fn parse_labelled_address(field: &str) -> Result<Address> {
    let start = field
        .rfind('[')
        .ok_or_else(|| PynnError::Parse(format!("no address in '{}'", field)))?;
    field[start..].parse()
}

fn parse_number(field: &str) -> Result<f64> {
    let field = field.trim();
    if field == "inf" {
        return Ok(f64::INFINITY);
    }
    field
        .parse()
        .map_err(|e| PynnError::Parse(format!("bad number '{}': {}", field, e)))
}

/// Parse a whole connection file. Blank lines and `#` comments are skipped.
pub fn parse_connections(text: &str) -> Result<Vec<ConnectionRecord>> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty() && !line.starts_with('#'))
        .map(|(n, line)| {
            ConnectionRecord::parse_line(line).map_err(|e| PynnError::Parse(format!("line {}: {}", n + 1, e)))
        })
        .collect()
}

/// Explicit list of connections by address
#[derive(Debug, Clone, Default)]
pub struct FromListConnector {
    pub connections: Vec<ConnectionRecord>,
}

impl FromListConnector {
    pub fn new(connections: Vec<ConnectionRecord>) -> Self {
        Self { connections }
    }
}

impl Connector for FromListConnector {
    fn describe(&self) -> String {
        format!("FromListConnector({} connections)", self.connections.len())
    }

    fn connect(&mut self, builder: &mut ConnectionBuilder<'_>) -> Result<()> {
        let (pre, post) = (builder.pre(), builder.post());
        for record in &self.connections {
            let source = pre.get(&record.pre)?;
            let target = post.get(&record.post)?;
            if post.is_local(target) {
                builder.connect(source, target, record.weight, record.delay)?;
            }
        }
        Ok(())
    }
}

/// Connections read from a file written by `Projection::save_connections`
#[derive(Debug, Clone)]
pub struct FromFileConnector {
    pub path: PathBuf,
}

impl FromFileConnector {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl Connector for FromFileConnector {
    fn describe(&self) -> String {
        format!("FromFileConnector({})", self.path.display())
    }

    fn connect(&mut self, builder: &mut ConnectionBuilder<'_>) -> Result<()> {
        let text = fs::read_to_string(&self.path)?;
        let records = parse_connections(&text)?;
        debug!("Read {} connections from {}", records.len(), self.path.display());
        FromListConnector::new(records).connect(builder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_round_trip() {
        let record = ConnectionRecord {
            pre: Address(vec![1, 2]),
            post: Address(vec![0]),
            weight: 0.125,
            delay: 1.7,
        };
        let line = record.to_line("exc", "out");
        assert_eq!(line, "exc[1, 2]\tout[0]\t0.125\t1.7");
        assert_eq!(ConnectionRecord::parse_line(&line).unwrap(), record);
    }

    #[test]
    fn test_parse_errors_carry_line_numbers() {
        let text = "a[0]\tb[0]\t1\t1\n\na[1]\tb[1]\t1\n";
        let err = parse_connections(text).unwrap_err();
        assert!(err.to_string().contains("line 3"));
    }

    #[test]
    fn test_probability_range() {
        assert!(FixedProbabilityConnector::new(1.5, false, SynapseValues::default()).is_err());
        assert!(FixedProbabilityConnector::new(0.2, false, SynapseValues::default()).is_ok());
    }

    #[test]
    fn test_default_delay_is_min_delay() {
        let mut values = SynapseValues::new(0.5, None);
        assert_eq!(values.next(0.2), (0.5, 0.2));
        let mut values = SynapseValues::new(0.5, Some(3.0.into()));
        assert_eq!(values.next(0.2), (0.5, 3.0));
    }
}
