use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::process_monitor::ProcessSample;

/// Keywords that identify one bot type. Matching is a case-insensitive
/// substring search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotSignature {
    pub bot_type: String,
    pub keywords: Vec<String>,
}

impl BotSignature {
    pub fn new(bot_type: &str, keywords: &[&str]) -> Self {
        Self {
            bot_type: bot_type.to_string(),
            keywords: keywords.iter().map(|k| k.to_lowercase()).collect(),
        }
    }

    fn matches(&self, haystack: &str) -> bool {
        self.keywords
            .iter()
            .any(|k| !k.is_empty() && haystack.contains(&k.to_lowercase()))
    }
}

/// Ordered signature table. The first signature that matches wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionStrategy {
    signatures: Vec<BotSignature>,
}

impl Default for DetectionStrategy {
    fn default() -> Self {
        Self::new(vec![
            BotSignature::new("MaiBot", &["maibot", "mai_bot", "main.py"]),
            BotSignature::new("MoFox_bot", &["mofox", "mofox_bot"]),
            BotSignature::new("NapCat", &["napcat", "qq"]),
        ])
    }
}

impl DetectionStrategy {
    pub fn new(signatures: Vec<BotSignature>) -> Self {
        Self { signatures }
    }

    /// Appends a signature with the lowest priority.
    pub fn push(&mut self, signature: BotSignature) {
        self.signatures.push(signature);
    }

    pub fn signatures(&self) -> &[BotSignature] {
        &self.signatures
    }

    pub fn identify_text(&self, text: &str) -> Option<&str> {
        let haystack = text.to_lowercase();
        self.signatures
            .iter()
            .find(|sig| sig.matches(&haystack))
            .map(|sig| sig.bot_type.as_str())
    }

    pub fn identify(&self, process: &ProcessSample) -> Option<&str> {
        self.identify_text(&process.searchable_text())
    }
}

/// A host process recognised as a bot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedProcess {
    pub process_key: String,
    pub pid: u32,
    pub name: String,
    pub bot_type: String,
    pub exe: Option<String>,
    pub cwd: Option<String>,
    pub cmdline: Vec<String>,
    pub memory_mb: f64,
    pub create_time: Option<DateTime<Local>>,
}

impl DetectedProcess {
    pub fn from_sample(sample: ProcessSample, bot_type: &str) -> Self {
        Self {
            process_key: process_key(bot_type, sample.pid),
            pid: sample.pid,
            name: sample.name,
            bot_type: bot_type.to_string(),
            exe: sample.exe,
            cwd: sample.cwd,
            cmdline: sample.cmdline,
            memory_mb: sample.memory_mb,
            create_time: sample.start_time,
        }
    }
}

pub fn process_key(bot_type: &str, pid: u32) -> String {
    format!("{}_{}", bot_type, pid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(name: &str, cmdline: &[&str]) -> ProcessSample {
        ProcessSample {
            pid: 42,
            name: name.to_string(),
            exe: None,
            cwd: None,
            cmdline: cmdline.iter().map(|s| s.to_string()).collect(),
            memory_mb: 12.5,
            start_time: None,
        }
    }

    #[test]
    fn default_table_recognises_known_bots() {
        let strategy = DetectionStrategy::default();
        assert_eq!(strategy.identify(&sample("python", &["python", "main.py"])), Some("MaiBot"));
        assert_eq!(strategy.identify(&sample("node", &["node", "MoFox_Bot/index.js"])), Some("MoFox_bot"));
        assert_eq!(strategy.identify(&sample("NapCatWinBootMain.exe", &[])), Some("NapCat"));
        assert_eq!(strategy.identify(&sample("bash", &["bash"])), None);
    }

    #[test]
    fn table_order_breaks_ties() {
        // matches both MaiBot (main.py) and NapCat (napcat); MaiBot is listed first
        let strategy = DetectionStrategy::default();
        let mixed = sample("python", &["python", "napcat/main.py"]);
        assert_eq!(strategy.identify(&mixed), Some("MaiBot"));

        let reordered = DetectionStrategy::new(vec![
            BotSignature::new("NapCat", &["napcat"]),
            BotSignature::new("MaiBot", &["main.py"]),
        ]);
        assert_eq!(reordered.identify(&mixed), Some("NapCat"));
    }

    #[test]
    fn pushed_signature_is_tried_last() {
        let mut strategy = DetectionStrategy::default();
        strategy.push(BotSignature::new("Lagrange", &["Lagrange.OneBot"]));
        assert_eq!(strategy.identify_text("./Lagrange.OneBot --config x"), Some("Lagrange"));
        assert_eq!(strategy.signatures().len(), 4);
    }

    #[test]
    fn detected_process_key_combines_type_and_pid() {
        let detected = DetectedProcess::from_sample(sample("qq", &[]), "NapCat");
        assert_eq!(detected.process_key, "NapCat_42");
        assert_eq!(detected.memory_mb, 12.5);
    }
}
