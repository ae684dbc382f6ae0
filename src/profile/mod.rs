//! Interning samples into a compact pprof-shaped aggregate and serializing
//! it as a gzip-compressed protocol-buffer message.
//!
//! Samples are accumulated root-first, the same orientation the Stack
//! Reconstructor produces them in; only `write` reverses each sample's
//! location-id list, which is the one point this module's internal
//! representation and the on-disk pprof convention (leaf-first) diverge.

use std::collections::HashMap;
use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};

use flate2::{write::GzEncoder, Compression};
use prost::Message;

use crate::core::types::{CallEntry, OutputError};

pub mod pprofs {
    include!("perftools.profiles.rs");
}
use self::pprofs::{Function, Line, Location, Profile, Sample, ValueType};

const PRESEED_STRINGS: &[&str] = &["", "samples", "count", "cpu", "nanoseconds"];
const IDX_SAMPLES: i64 = 1;
const IDX_COUNT: i64 = 2;
const IDX_CPU: i64 = 3;
const IDX_NANOSECONDS: i64 = 4;

/// `(filename_index, name_index, first_line)`, the key that makes two
/// `FunctionDescriptor`s equal for interning purposes.
type FunctionKey = (usize, usize, i64);

/// `(function_id, line)`, one location per distinct attribution.
type LocationKey = (u64, i64);

/// Append-only accumulator of interned strings, functions, locations, and
/// samples. Nothing here is ever re-keyed or shrunk once interned.
pub struct ProfileAccumulator {
    strings: Vec<String>,
    string_ids: HashMap<String, usize>,
    functions: Vec<Function>,
    function_ids: HashMap<FunctionKey, u64>,
    locations: Vec<Location>,
    location_ids: HashMap<LocationKey, u64>,
    /// Root-first location-id lists, one per sample.
    samples: Vec<Vec<u64>>,
    empty_samples: u64,
    period_nanoseconds: i64,
    start_time: SystemTime,
}

impl ProfileAccumulator {
    pub fn new(hz: u32) -> Self {
        let mut strings = Vec::with_capacity(PRESEED_STRINGS.len());
        let mut string_ids = HashMap::with_capacity(PRESEED_STRINGS.len());
        for s in PRESEED_STRINGS {
            string_ids.insert((*s).to_string(), strings.len());
            strings.push((*s).to_string());
        }
        ProfileAccumulator {
            strings,
            string_ids,
            functions: Vec::new(),
            function_ids: HashMap::new(),
            locations: Vec::new(),
            location_ids: HashMap::new(),
            samples: Vec::new(),
            empty_samples: 0,
            period_nanoseconds: 1_000_000_000 / i64::from(hz.max(1)),
            start_time: SystemTime::now(),
        }
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn empty_sample_count(&self) -> u64 {
        self.empty_samples
    }

    pub fn intern_string(&mut self, s: &str) -> usize {
        if let Some(&id) = self.string_ids.get(s) {
            return id;
        }
        let id = self.strings.len();
        self.strings.push(s.to_string());
        self.string_ids.insert(s.to_string(), id);
        id
    }

    pub fn intern_function(&mut self, filename: &str, name: &str, line: i64) -> u64 {
        let filename_idx = self.intern_string(filename);
        let name_idx = self.intern_string(name);
        let key: FunctionKey = (filename_idx, name_idx, line);
        if let Some(&id) = self.function_ids.get(&key) {
            return id;
        }
        let id = self.functions.len() as u64 + 1;
        self.functions.push(Function {
            id,
            name: name_idx as i64,
            system_name: 0,
            filename: filename_idx as i64,
            start_line: line,
        });
        self.function_ids.insert(key, id);
        id
    }

    pub fn intern_location(&mut self, function_id: u64, line: i64) -> u64 {
        let key: LocationKey = (function_id, line);
        if let Some(&id) = self.location_ids.get(&key) {
            return id;
        }
        let id = self.locations.len() as u64 + 1;
        self.locations.push(Location {
            id,
            mapping_id: 0,
            address: 0,
            line: vec![Line { function_id, line }],
            is_folded: false,
        });
        self.location_ids.insert(key, id);
        id
    }

    /// Interns every frame in `stack` and appends its location-id list,
    /// root-first, to the sample list. `empty_flag` marks a sample taken
    /// while the target's call stack was empty (idle), which is still a
    /// real sample and counted, just tracked separately for stats.
    pub fn add_sample(&mut self, stack: &[CallEntry], empty_flag: bool) {
        let mut location_ids = Vec::with_capacity(stack.len());
        for entry in stack {
            let (filename, line) = entry.attribution();
            let function_id = self.intern_function(filename, &entry.function.name, line);
            location_ids.push(self.intern_location(function_id, line));
        }
        self.samples.push(location_ids);
        if empty_flag {
            self.empty_samples += 1;
        }
    }

    /// Builds the pprof `Profile` message and writes it gzip-compressed to
    /// `out`. Each sample's location-id list is cloned and reversed here —
    /// the only place accumulation order (root-first) and wire order
    /// (leaf-first) are reconciled.
    pub fn write(&self, out: &mut dyn Write) -> Result<(), OutputError> {
        let profile = Profile {
            sample_type: vec![
                ValueType { r#type: IDX_SAMPLES, unit: IDX_COUNT },
                ValueType { r#type: IDX_CPU, unit: IDX_NANOSECONDS },
            ],
            sample: self
                .samples
                .iter()
                .map(|location_ids| {
                    let mut leaf_first = location_ids.clone();
                    leaf_first.reverse();
                    Sample { location_id: leaf_first, value: vec![1, self.period_nanoseconds], label: vec![] }
                })
                .collect(),
            mapping: vec![],
            location: self.locations.clone(),
            function: self.functions.clone(),
            string_table: self.strings.clone(),
            drop_frames: 0,
            keep_frames: 0,
            time_nanos: self
                .start_time
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as i64)
                .unwrap_or(0),
            duration_nanos: self
                .start_time
                .elapsed()
                .map(|d| d.as_nanos() as i64)
                .unwrap_or(0),
            period_type: Some(ValueType { r#type: IDX_CPU, unit: IDX_NANOSECONDS }),
            period: self.period_nanoseconds,
            comment: vec![],
            default_sample_type: IDX_SAMPLES,
        };

        let mut pprof_bytes = Vec::new();
        profile.encode(&mut pprof_bytes)?;

        let mut gzip = GzEncoder::new(Vec::new(), Compression::default());
        gzip.write_all(&pprof_bytes)?;
        out.write_all(&gzip.finish()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{FunctionDescriptor, FunctionKind, SourceLocation};
    use flate2::read::GzDecoder;
    use std::io::Read as _;

    fn entry(name: &str, filename: &str, line: i64) -> CallEntry {
        CallEntry {
            function: FunctionDescriptor {
                address: 0,
                name: name.to_string(),
                kind: FunctionKind::Script,
                location: SourceLocation { filename: filename.to_string(), first_line: line, last_line: line },
            },
            call_site_filename: String::new(),
            call_site_line: 0,
        }
    }

    #[test]
    fn preseeded_strings_occupy_fixed_indices() {
        let acc = ProfileAccumulator::new(100);
        assert_eq!(acc.strings[0], "");
        assert_eq!(acc.strings[1], "samples");
        assert_eq!(acc.strings[4], "nanoseconds");
    }

    #[test]
    fn interning_is_idempotent() {
        let mut acc = ProfileAccumulator::new(100);
        let a = acc.intern_string("main.zeek");
        let b = acc.intern_string("main.zeek");
        assert_eq!(a, b);
        let f1 = acc.intern_function("main.zeek", "dns_full", 10);
        let f2 = acc.intern_function("main.zeek", "dns_full", 10);
        assert_eq!(f1, f2);
        let l1 = acc.intern_location(f1, 10);
        let l2 = acc.intern_location(f2, 10);
        assert_eq!(l1, l2);
    }

    #[test]
    fn distinct_first_lines_intern_to_distinct_functions() {
        let mut acc = ProfileAccumulator::new(100);
        let f1 = acc.intern_function("dns.bif", "dns_message", 442);
        let f2 = acc.intern_function("dns.bif", "dns_message", 500);
        assert_ne!(f1, f2);
    }

    #[test]
    fn add_sample_counts_toward_totals() {
        let mut acc = ProfileAccumulator::new(100);
        acc.add_sample(&[entry("root", "init.zeek", 1)], false);
        acc.add_sample(&[], true);
        assert_eq!(acc.sample_count(), 2);
        assert_eq!(acc.empty_sample_count(), 1);
    }

    #[test]
    fn write_roundtrips_and_reverses_location_order_to_leaf_first() {
        let mut acc = ProfileAccumulator::new(100);
        // root-first: outer() calls inner()
        acc.add_sample(&[entry("outer", "a.zeek", 1), entry("inner", "b.zeek", 2)], false);

        let mut buf = Vec::new();
        acc.write(&mut buf).expect("write");

        let mut gz = GzDecoder::new(&*buf);
        let mut raw = Vec::new();
        gz.read_to_end(&mut raw).unwrap();
        let decoded = pprofs::Profile::decode(&*raw).expect("decode");

        assert_eq!(decoded.sample.len(), 1);
        let location_ids = &decoded.sample[0].location_id;
        assert_eq!(location_ids.len(), 2);

        // leaf-first on the wire: the first location id must resolve to "inner".
        let leaf_loc = decoded.location.iter().find(|l| l.id == location_ids[0]).unwrap();
        let leaf_func_id = leaf_loc.line[0].function_id;
        let leaf_func = decoded.function.iter().find(|f| f.id == leaf_func_id).unwrap();
        assert_eq!(decoded.string_table[leaf_func.name as usize], "inner");
    }

    #[test]
    fn empty_accumulator_still_serializes() {
        let acc = ProfileAccumulator::new(100);
        let mut buf = Vec::new();
        acc.write(&mut buf).expect("write");
        assert!(!buf.is_empty());
    }
}
