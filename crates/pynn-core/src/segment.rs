//! Recorded output: spike trains, sampled signals and the segment holding them.

use chrono::{DateTime, Local};
use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::identity::CellId;
use crate::{PynnError, Result, Time};

/// Physical units with SI prefixes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Unit {
    // Time
    Second,
    Millisecond,

    // Voltage
    Volt,
    Millivolt,

    // Current
    Ampere,
    Nanoampere,

    // Conductance
    Siemens,
    Microsiemens,

    // Capacitance
    Farad,
    Nanofarad,

    // Frequency
    Hertz,

    Dimensionless,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dimension {
    Time,
    Voltage,
    Current,
    Conductance,
    Capacitance,
    Frequency,
    None,
}

impl Unit {
    /// Convert to SI base units
    pub fn to_si_factor(&self) -> f64 {
        match self {
            Unit::Second => 1.0,
            Unit::Millisecond => 1e-3,
            Unit::Volt => 1.0,
            Unit::Millivolt => 1e-3,
            Unit::Ampere => 1.0,
            Unit::Nanoampere => 1e-9,
            Unit::Siemens => 1.0,
            Unit::Microsiemens => 1e-6,
            Unit::Farad => 1.0,
            Unit::Nanofarad => 1e-9,
            Unit::Hertz => 1.0,
            Unit::Dimensionless => 1.0,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Unit::Second => "s",
            Unit::Millisecond => "ms",
            Unit::Volt => "V",
            Unit::Millivolt => "mV",
            Unit::Ampere => "A",
            Unit::Nanoampere => "nA",
            Unit::Siemens => "S",
            Unit::Microsiemens => "uS",
            Unit::Farad => "F",
            Unit::Nanofarad => "nF",
            Unit::Hertz => "Hz",
            Unit::Dimensionless => "dimensionless",
        }
    }

    fn dimension(&self) -> Dimension {
        match self {
            Unit::Second | Unit::Millisecond => Dimension::Time,
            Unit::Volt | Unit::Millivolt => Dimension::Voltage,
            Unit::Ampere | Unit::Nanoampere => Dimension::Current,
            Unit::Siemens | Unit::Microsiemens => Dimension::Conductance,
            Unit::Farad | Unit::Nanofarad => Dimension::Capacitance,
            Unit::Hertz => Dimension::Frequency,
            Unit::Dimensionless => Dimension::None,
        }
    }

    /// Factor turning a value in `self` into a value in `to`.
    ///
    /// A dimensionless side on either end means "leave the number alone".
    pub fn factor_to(&self, to: Unit) -> Result<f64> {
        if *self == Unit::Dimensionless || to == Unit::Dimensionless {
            return Ok(1.0);
        }
        if self.dimension() != to.dimension() {
            return Err(PynnError::InvalidArgument(format!(
                "cannot convert {} to {}",
                self, to
            )));
        }
        Ok(self.to_si_factor() / to.to_si_factor())
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Spike times of one cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpikeTrain {
    pub times: Vec<Time>,
    pub t_start: Time,
    pub t_stop: Time,
    pub units: Unit,
    pub source_population: String,
    pub source_id: CellId,
}

impl SpikeTrain {
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Mean firing rate in Hz over `[t_start, t_stop]`
    pub fn mean_rate(&self) -> f64 {
        let duration = self.t_stop - self.t_start;
        if duration <= 0.0 {
            return 0.0;
        }
        self.times.len() as f64 / (duration / 1000.0)
    }
}

/// Regularly sampled values, one column per recorded cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalogSignalArray {
    pub name: String,
    /// Shape `[samples, channels]`
    pub signal: Array2<f64>,
    pub units: Unit,
    pub t_start: Time,
    pub sampling_period: Time,
    pub source_population: String,
    pub channel_indexes: Vec<usize>,
    pub source_ids: Vec<CellId>,
}

impl AnalogSignalArray {
    pub fn n_samples(&self) -> usize {
        self.signal.nrows()
    }

    pub fn n_channels(&self) -> usize {
        self.signal.ncols()
    }

    pub fn times(&self) -> Vec<Time> {
        (0..self.n_samples())
            .map(|i| self.t_start + i as f64 * self.sampling_period)
            .collect()
    }

    /// Trace of one cell
    pub fn channel(&self, id: CellId) -> Option<ArrayView1<'_, f64>> {
        self.source_ids
            .iter()
            .position(|&s| s == id)
            .map(|col| self.signal.column(col))
    }
}

/// One read's worth of recorded data. Built fresh each time and read-only
/// afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    name: String,
    description: String,
    rec_datetime: DateTime<Local>,
    spiketrains: Vec<SpikeTrain>,
    analogsignalarrays: Vec<AnalogSignalArray>,
}

impl Segment {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        spiketrains: Vec<SpikeTrain>,
        analogsignalarrays: Vec<AnalogSignalArray>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            rec_datetime: Local::now(),
            spiketrains,
            analogsignalarrays,
        }
    }

    /// New segment holding everything in `parts`
    pub fn combine(
        name: impl Into<String>,
        description: impl Into<String>,
        parts: impl IntoIterator<Item = Segment>,
    ) -> Self {
        let mut spiketrains = Vec::new();
        let mut analogsignalarrays = Vec::new();
        for part in parts {
            spiketrains.extend(part.spiketrains);
            analogsignalarrays.extend(part.analogsignalarrays);
        }
        Self::new(name, description, spiketrains, analogsignalarrays)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// When the segment was read
    pub fn rec_datetime(&self) -> DateTime<Local> {
        self.rec_datetime
    }

    pub fn spiketrains(&self) -> &[SpikeTrain] {
        &self.spiketrains
    }

    pub fn analogsignalarrays(&self) -> &[AnalogSignalArray] {
        &self.analogsignalarrays
    }

    pub fn spiketrain(&self, id: CellId) -> Option<&SpikeTrain> {
        self.spiketrains.iter().find(|st| st.source_id == id)
    }

    pub fn analogsignal(&self, name: &str) -> Option<&AnalogSignalArray> {
        self.analogsignalarrays.iter().find(|a| a.name == name)
    }

    pub fn total_spikes(&self) -> usize {
        self.spiketrains.iter().map(SpikeTrain::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_unit_conversion() {
        assert!((Unit::Volt.factor_to(Unit::Millivolt).unwrap() - 1000.0).abs() < 1e-9);
        assert!((Unit::Siemens.factor_to(Unit::Microsiemens).unwrap() - 1e6).abs() < 1e-3);
        assert_eq!(Unit::Millivolt.factor_to(Unit::Dimensionless).unwrap(), 1.0);
        assert!(Unit::Volt.factor_to(Unit::Millisecond).is_err());
    }

    #[test]
    fn test_signal_times_and_channels() {
        let sig = AnalogSignalArray {
            name: "v".into(),
            signal: array![[-65.0, -64.0], [-64.5, -63.0], [-64.0, -62.0]],
            units: Unit::Millivolt,
            t_start: 0.0,
            sampling_period: 0.1,
            source_population: "p".into(),
            channel_indexes: vec![0, 3],
            source_ids: vec![CellId(10), CellId(13)],
        };
        assert_eq!(sig.n_samples(), 3);
        let times = sig.times();
        assert!((times[2] - 0.2).abs() < 1e-12);
        assert_eq!(sig.channel(CellId(13)).unwrap()[1], -63.0);
        assert!(sig.channel(CellId(11)).is_none());
    }

    #[test]
    fn test_combine_and_rate() {
        let st = SpikeTrain {
            times: vec![10.0, 20.0],
            t_start: 0.0,
            t_stop: 1000.0,
            units: Unit::Millisecond,
            source_population: "p".into(),
            source_id: CellId(1),
        };
        assert!((st.mean_rate() - 2.0).abs() < 1e-12);

        let a = Segment::new("a", "", vec![st.clone()], vec![]);
        let b = Segment::new("b", "", vec![st], vec![]);
        let seg = Segment::combine("p", "both", [a, b]);
        assert_eq!(seg.spiketrains().len(), 2);
        assert_eq!(seg.total_spikes(), 4);
    }

    #[test]
    fn test_segment_accessors() {
        let before = Local::now();
        let seg = Segment::new("exc", "3 cells", vec![], vec![]);
        assert_eq!(seg.name(), "exc");
        assert_eq!(seg.description(), "3 cells");
        assert!(seg.rec_datetime() >= before);
        assert!(seg.spiketrains().is_empty());
        assert!(seg.analogsignalarrays().is_empty());

        let json = serde_json::to_value(&seg).unwrap();
        assert_eq!(json["name"], "exc");
        let back: Segment = serde_json::from_value(json).unwrap();
        assert_eq!(back.name(), "exc");
    }
}
