//! CPU limits: per-structure counts, capacities, and scheduling knobs.
//!
//! Pure data consumed at CPU construction, with an INI representation for
//! the host drivers:
//!
//! ```ini
//! [memory]
//! capacity_1 = 1000000
//! read_only_1 = false
//! instances = 4
//!
//! [stacks]
//! capacity = 1000000
//! instances = 4
//! ```
//!
//! `[queues]` and `[tapes]` mirror `[stacks]`; `[cpu]` holds `callstack` and
//! `interrupt_period`. Unknown sections and keys are rejected.

use thiserror::Error;

/// Number of named instances per structure family.
pub const INSTANCES: usize = 26;

/// Errors raised while loading or validating limits.
#[derive(Debug, Error)]
pub enum LimitsError {
    #[error("line {line}: expected 'key = value' or '[section]'")]
    Syntax { line: usize },
    #[error("unknown section: [{0}]")]
    UnknownSection(String),
    #[error("unknown key '{key}' in section [{section}]")]
    UnknownKey { section: String, key: String },
    #[error("invalid value '{value}' for key '{key}'")]
    InvalidValue { key: String, value: String },
    #[error("{family} instance count {count} exceeds {INSTANCES}")]
    TooManyInstances { family: &'static str, count: u32 },
    #[error("interrupt period must be nonzero")]
    ZeroInterruptPeriod,
    #[error("tape capacity must be nonzero")]
    ZeroTapeCapacity,
}

/// Resource limits applied when a CPU (re)initializes.
///
/// Instances beyond a family's count stay disabled; every access to a
/// disabled instance faults at run time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuLimits {
    /// Cell count of each memory, index 0 = `MA`.
    pub memory_capacity: [u32; INSTANCES],
    /// Write protection per memory.
    pub memory_read_only: [bool; INSTANCES],
    /// Enabled memories, 0..=26.
    pub memories_count: u32,
    pub stack_capacity: u32,
    pub stacks_count: u32,
    pub queue_capacity: u32,
    pub queues_count: u32,
    pub tape_capacity: u32,
    pub tapes_count: u32,
    /// Maximum call depth.
    pub callstack_capacity: u32,
    /// Steps between cooperative yields.
    pub interrupt_period: u32,
}

impl Default for CpuLimits {
    fn default() -> Self {
        Self {
            memory_capacity: [1_000_000; INSTANCES],
            memory_read_only: [false; INSTANCES],
            memories_count: 4,
            stack_capacity: 1_000_000,
            stacks_count: 4,
            queue_capacity: 1_000_000,
            queues_count: 4,
            tape_capacity: 1_000_000,
            tapes_count: 4,
            callstack_capacity: 1_000,
            interrupt_period: u32::MAX,
        }
    }
}

impl CpuLimits {
    /// Checks counts and capacities; called at CPU construction.
    pub fn validate(&self) -> Result<(), LimitsError> {
        for (family, count) in [
            ("memory", self.memories_count),
            ("stack", self.stacks_count),
            ("queue", self.queues_count),
            ("tape", self.tapes_count),
        ] {
            if count > INSTANCES as u32 {
                return Err(LimitsError::TooManyInstances { family, count });
            }
        }
        if self.interrupt_period == 0 {
            return Err(LimitsError::ZeroInterruptPeriod);
        }
        if self.tapes_count > 0 && self.tape_capacity == 0 {
            return Err(LimitsError::ZeroTapeCapacity);
        }
        Ok(())
    }

    /// Parses limits from INI text, starting from the defaults.
    pub fn from_ini(text: &str) -> Result<Self, LimitsError> {
        let mut limits = CpuLimits::default();
        let mut section = String::new();

        for (line_no, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                section = name.trim().to_string();
                match section.as_str() {
                    "memory" | "stacks" | "queues" | "tapes" | "cpu" => continue,
                    _ => return Err(LimitsError::UnknownSection(section)),
                }
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(LimitsError::Syntax { line: line_no + 1 });
            };
            let (key, value) = (key.trim(), value.trim());
            limits.apply(&section, key, value)?;
        }

        Ok(limits)
    }

    fn apply(&mut self, section: &str, key: &str, value: &str) -> Result<(), LimitsError> {
        let unknown = || LimitsError::UnknownKey {
            section: section.to_string(),
            key: key.to_string(),
        };
        match section {
            "memory" => {
                if let Some(slot) = indexed_key(key, "capacity_") {
                    self.memory_capacity[slot] = parse_u32(key, value)?;
                } else if let Some(slot) = indexed_key(key, "read_only_") {
                    self.memory_read_only[slot] = parse_bool(key, value)?;
                } else if key == "instances" {
                    self.memories_count = parse_u32(key, value)?;
                } else {
                    return Err(unknown());
                }
            }
            "stacks" => match key {
                "capacity" => self.stack_capacity = parse_u32(key, value)?,
                "instances" => self.stacks_count = parse_u32(key, value)?,
                _ => return Err(unknown()),
            },
            "queues" => match key {
                "capacity" => self.queue_capacity = parse_u32(key, value)?,
                "instances" => self.queues_count = parse_u32(key, value)?,
                _ => return Err(unknown()),
            },
            "tapes" => match key {
                "capacity" => self.tape_capacity = parse_u32(key, value)?,
                "instances" => self.tapes_count = parse_u32(key, value)?,
                _ => return Err(unknown()),
            },
            "cpu" => match key {
                "callstack" => self.callstack_capacity = parse_u32(key, value)?,
                "interrupt_period" => self.interrupt_period = parse_u32(key, value)?,
                _ => return Err(unknown()),
            },
            _ => {
                return Err(LimitsError::UnknownKey {
                    section: section.to_string(),
                    key: key.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Serializes the limits back to INI text.
    pub fn to_ini(&self) -> String {
        let mut out = String::new();
        out.push_str("[memory]\n");
        for i in 0..INSTANCES {
            out.push_str(&format!("capacity_{} = {}\n", i + 1, self.memory_capacity[i]));
            out.push_str(&format!("read_only_{} = {}\n", i + 1, self.memory_read_only[i]));
        }
        out.push_str(&format!("instances = {}\n", self.memories_count));
        for (name, capacity, instances) in [
            ("stacks", self.stack_capacity, self.stacks_count),
            ("queues", self.queue_capacity, self.queues_count),
            ("tapes", self.tape_capacity, self.tapes_count),
        ] {
            out.push_str(&format!(
                "\n[{name}]\ncapacity = {capacity}\ninstances = {instances}\n"
            ));
        }
        out.push_str(&format!(
            "\n[cpu]\ncallstack = {}\ninterrupt_period = {}\n",
            self.callstack_capacity, self.interrupt_period
        ));
        out
    }
}

/// Matches keys like `capacity_7`, returning the 0-based instance slot.
fn indexed_key(key: &str, prefix: &str) -> Option<usize> {
    let n: usize = key.strip_prefix(prefix)?.parse().ok()?;
    (1..=INSTANCES).contains(&n).then(|| n - 1)
}

fn parse_u32(key: &str, value: &str) -> Result<u32, LimitsError> {
    value.parse().map_err(|_| LimitsError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, LimitsError> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(LimitsError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}
