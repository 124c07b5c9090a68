//! Quantization selection policy.
//!
//! Pure ranking of remote variants against the machine's resources. All
//! I/O lives in [`SystemFacts::detect`]; the ranking itself is a function
//! of its arguments only.

use std::fmt;
use std::process::Command;

use serde::{Deserialize, Serialize};

use crate::model::fetch::RemoteVariant;

/// Fraction of the memory budget a variant may occupy. Larger files are
/// excluded from the ranking regardless of quantization class.
pub const MEMORY_SAFETY_FRACTION: f64 = 0.8;

const GIB: u64 = 1024 * 1024 * 1024;

/// Recognized quantization classes, highest fidelity first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(non_camel_case_types)]
pub enum QuantClass {
    Q8_0,
    Q6_K,
    Q5_K_M,
    Q5_K_S,
    Q4_K_M,
    Q4_K_S,
    Q4_0,
    Q3_K_M,
    Q3_K_L,
    Q2_K,
}

impl QuantClass {
    pub fn label(&self) -> &'static str {
        match self {
            QuantClass::Q8_0 => "Q8_0",
            QuantClass::Q6_K => "Q6_K",
            QuantClass::Q5_K_M => "Q5_K_M",
            QuantClass::Q5_K_S => "Q5_K_S",
            QuantClass::Q4_K_M => "Q4_K_M",
            QuantClass::Q4_K_S => "Q4_K_S",
            QuantClass::Q4_0 => "Q4_0",
            QuantClass::Q3_K_M => "Q3_K_M",
            QuantClass::Q3_K_L => "Q3_K_L",
            QuantClass::Q2_K => "Q2_K",
        }
    }

    const ALL: [QuantClass; 10] = [
        QuantClass::Q8_0,
        QuantClass::Q6_K,
        QuantClass::Q5_K_M,
        QuantClass::Q5_K_S,
        QuantClass::Q4_K_M,
        QuantClass::Q4_K_S,
        QuantClass::Q4_0,
        QuantClass::Q3_K_M,
        QuantClass::Q3_K_L,
        QuantClass::Q2_K,
    ];

    /// Detect the quantization class embedded in a remote filename.
    pub fn from_filename(name: &str) -> Option<Self> {
        let upper = name.to_ascii_uppercase();
        Self::ALL.into_iter().find(|q| upper.contains(q.label()))
    }
}

impl fmt::Display for QuantClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Resource facts the policy ranks against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemFacts {
    pub total_ram_bytes: u64,
    pub has_gpu: bool,
    /// Dedicated GPU memory when known. Bounds the memory budget instead of
    /// system RAM when a GPU is present.
    pub vram_bytes: Option<u64>,
}

impl SystemFacts {
    /// Probe the local machine. macOS counts as GPU-capable (Metal);
    /// elsewhere an `nvidia-smi` that exits cleanly does.
    pub fn detect() -> Self {
        Self {
            total_ram_bytes: detect_total_ram(),
            has_gpu: detect_gpu(),
            vram_bytes: None,
        }
    }

    /// Memory pool a model must fit into.
    pub fn memory_budget(&self) -> u64 {
        match (self.has_gpu, self.vram_bytes) {
            (true, Some(vram)) => vram,
            _ => self.total_ram_bytes,
        }
    }

    fn capability(&self) -> &'static [QuantClass] {
        let ram_gb = self.total_ram_bytes / GIB;
        if self.has_gpu && ram_gb >= 32 {
            &[QuantClass::Q8_0, QuantClass::Q6_K, QuantClass::Q5_K_M]
        } else if (self.has_gpu && ram_gb >= 16) || ram_gb >= 24 {
            &[QuantClass::Q5_K_M, QuantClass::Q4_K_M, QuantClass::Q4_0]
        } else {
            &[QuantClass::Q4_K_M, QuantClass::Q3_K_M, QuantClass::Q2_K]
        }
    }
}

/// Rank the downloadable variants for this machine, best first.
///
/// Variants larger than [`MEMORY_SAFETY_FRACTION`] of the memory budget are
/// dropped outright. The preferred quantization classes for the machine's
/// capability bucket come first, in table order; every other admissible
/// variant follows in ascending size order.
pub fn rank(variants: &[RemoteVariant], facts: &SystemFacts) -> Vec<RemoteVariant> {
    let budget = (facts.memory_budget() as f64 * MEMORY_SAFETY_FRACTION) as u64;
    let admissible: Vec<&RemoteVariant> = variants.iter().filter(|v| v.size <= budget).collect();

    let mut ranked: Vec<RemoteVariant> = Vec::new();
    for class in facts.capability() {
        for variant in &admissible {
            if variant.quantization == Some(*class) {
                ranked.push((*variant).clone());
            }
        }
    }
    let mut rest: Vec<&RemoteVariant> = admissible
        .iter()
        .filter(|v| !ranked.iter().any(|r| r.filename == v.filename))
        .copied()
        .collect();
    rest.sort_by_key(|v| v.size);
    ranked.extend(rest.into_iter().cloned());
    ranked
}

fn detect_total_ram() -> u64 {
    #[cfg(target_os = "linux")]
    {
        let kb = std::fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|content| {
                content
                    .lines()
                    .find(|l| l.starts_with("MemTotal:"))
                    .and_then(|l| l.split_whitespace().nth(1))
                    .and_then(|s| s.parse::<u64>().ok())
            });
        if let Some(kb) = kb {
            return kb * 1024;
        }
    }
    #[cfg(target_os = "macos")]
    {
        let bytes = Command::new("sysctl")
            .args(["-n", "hw.memsize"])
            .output()
            .ok()
            .and_then(|out| String::from_utf8(out.stdout).ok())
            .and_then(|s| s.trim().parse::<u64>().ok());
        if let Some(bytes) = bytes {
            return bytes;
        }
    }
    8 * GIB
}

fn detect_gpu() -> bool {
    if cfg!(target_os = "macos") {
        return true;
    }
    Command::new("nvidia-smi")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variant(filename: &str, size: u64) -> RemoteVariant {
        RemoteVariant {
            filename: filename.to_string(),
            path: filename.to_string(),
            size,
            quantization: QuantClass::from_filename(filename),
            url: format!("https://example.invalid/{filename}"),
        }
    }

    fn facts(ram_gb: u64, has_gpu: bool) -> SystemFacts {
        SystemFacts {
            total_ram_bytes: ram_gb * GIB,
            has_gpu,
            vram_bytes: None,
        }
    }

    #[test]
    fn quant_class_from_filename() {
        assert_eq!(
            QuantClass::from_filename("mistral-7b-instruct.Q4_K_M.gguf"),
            Some(QuantClass::Q4_K_M)
        );
        assert_eq!(
            QuantClass::from_filename("model-q8_0.gguf"),
            Some(QuantClass::Q8_0)
        );
        assert_eq!(QuantClass::from_filename("model-f16.gguf"), None);
    }

    #[test]
    fn high_capability_prefers_q8() {
        let variants = [
            variant("m.Q4_K_M.gguf", 4 * GIB),
            variant("m.Q8_0.gguf", 8 * GIB),
            variant("m.Q6_K.gguf", 6 * GIB),
        ];
        let ranked = rank(&variants, &facts(64, true));
        assert_eq!(ranked[0].filename, "m.Q8_0.gguf");
        assert_eq!(ranked[1].filename, "m.Q6_K.gguf");
    }

    #[test]
    fn low_capability_prefers_small_quants() {
        let variants = [
            variant("m.Q8_0.gguf", 8 * GIB),
            variant("m.Q4_K_M.gguf", 4 * GIB),
        ];
        let ranked = rank(&variants, &facts(16, false));
        assert_eq!(ranked[0].filename, "m.Q4_K_M.gguf");
    }

    #[test]
    fn oversized_variants_are_excluded_regardless_of_class() {
        let variants = [
            variant("m.Q8_0.gguf", 15 * GIB),
            variant("m.Q2_K.gguf", 3 * GIB),
        ];
        // 16 GiB of RAM: the safety margin rules the Q8_0 file out even for
        // a bucket that would otherwise prefer it.
        let ranked = rank(&variants, &facts(16, true));
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].filename, "m.Q2_K.gguf");
    }

    #[test]
    fn vram_bounds_the_budget_when_gpu_present() {
        let variants = [variant("m.Q4_K_M.gguf", 10 * GIB)];
        let facts = SystemFacts {
            total_ram_bytes: 64 * GIB,
            has_gpu: true,
            vram_bytes: Some(8 * GIB),
        };
        assert!(rank(&variants, &facts).is_empty());
    }

    #[test]
    fn unclassified_variants_rank_after_preferred_by_size() {
        let variants = [
            variant("m-f16.gguf", 2 * GIB),
            variant("m.Q4_K_M.gguf", 4 * GIB),
        ];
        let ranked = rank(&variants, &facts(16, false));
        assert_eq!(ranked[0].filename, "m.Q4_K_M.gguf");
        assert_eq!(ranked[1].filename, "m-f16.gguf");
    }
}
