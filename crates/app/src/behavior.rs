//! Canonical behavior taxonomy and label mapping.
//!
//! The six categories are closed and their order is fixed: counts, the order
//! list, and the legend all surface them identically so chart axes stay
//! stable from frame to frame.

use serde::Serialize;

/// One of the six canonical classroom behaviors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Behavior {
    LookingUp,
    LookingDown,
    LyingOnDesk,
    LookingBack,
    UsingPhone,
    Standing,
}

impl Behavior {
    /// Fixed surfacing order shared by counts, order list, and legend.
    pub const ORDER: [Behavior; 6] = [
        Behavior::LookingUp,
        Behavior::LookingDown,
        Behavior::LyingOnDesk,
        Behavior::LookingBack,
        Behavior::UsingPhone,
        Behavior::Standing,
    ];

    /// The six single-letter codes in surfacing order.
    pub const CODES: [&'static str; 6] = ["u", "d", "c", "b", "p", "s"];

    pub fn code(self) -> &'static str {
        match self {
            Behavior::LookingUp => "u",
            Behavior::LookingDown => "d",
            Behavior::LyingOnDesk => "c",
            Behavior::LookingBack => "b",
            Behavior::UsingPhone => "p",
            Behavior::Standing => "s",
        }
    }

    pub fn label_zh(self) -> &'static str {
        match self {
            Behavior::LookingUp => "抬头",
            Behavior::LookingDown => "低头",
            Behavior::LyingOnDesk => "趴桌",
            Behavior::LookingBack => "回头",
            Behavior::UsingPhone => "使用手机",
            Behavior::Standing => "站立",
        }
    }

    pub fn label_en(self) -> &'static str {
        match self {
            Behavior::LookingUp => "LookingUp",
            Behavior::LookingDown => "LookingDown",
            Behavior::LyingOnDesk => "LyingOnDesk",
            Behavior::LookingBack => "LookingBack",
            Behavior::UsingPhone => "UsingPhone",
            Behavior::Standing => "Standing",
        }
    }

    /// Map a raw model class label to its canonical behavior.
    ///
    /// The label is trimmed, lower-cased, and stripped of spaces and
    /// underscores, then matched against the canonical English keys first,
    /// the alias table second, and the Chinese substrings of the raw text
    /// last. Unrecognized labels (including empty ones) map to `None`;
    /// callers treat that as "uncategorized", never as an error.
    pub fn from_label(raw: &str) -> Option<Behavior> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        let key: String = raw
            .to_lowercase()
            .chars()
            .filter(|c| *c != ' ' && *c != '_')
            .collect();

        let mapped = match key.as_str() {
            // canonical training-set names
            "lookingup" => Some(Behavior::LookingUp),
            "lookingdown" => Some(Behavior::LookingDown),
            "lyingondesk" => Some(Behavior::LyingOnDesk),
            "lookingback" => Some(Behavior::LookingBack),
            "usingphone" => Some(Behavior::UsingPhone),
            "standing" => Some(Behavior::Standing),
            // aliases seen in older model exports
            "lookinguplook" | "up" | "raisehead" => Some(Behavior::LookingUp),
            "down" => Some(Behavior::LookingDown),
            "desk" => Some(Behavior::LyingOnDesk),
            "back" => Some(Behavior::LookingBack),
            "phone" => Some(Behavior::UsingPhone),
            "stand" => Some(Behavior::Standing),
            _ => None,
        };
        if mapped.is_some() {
            return mapped;
        }

        // Chinese labels match as substrings of the untransformed text.
        if raw.contains("抬头") {
            return Some(Behavior::LookingUp);
        }
        if raw.contains("低头") {
            return Some(Behavior::LookingDown);
        }
        if raw.contains('趴') || raw.contains('伏') {
            return Some(Behavior::LyingOnDesk);
        }
        if raw.contains("回头") || raw.contains('后') {
            return Some(Behavior::LookingBack);
        }
        if raw.contains("手机") {
            return Some(Behavior::UsingPhone);
        }
        if raw.contains('站') {
            return Some(Behavior::Standing);
        }
        None
    }
}

/// Per-frame tally over the six canonical codes; every key is always
/// present, zero-initialized.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BehaviorCounts {
    pub u: u32,
    pub d: u32,
    pub c: u32,
    pub b: u32,
    pub p: u32,
    pub s: u32,
}

impl BehaviorCounts {
    pub fn record(&mut self, behavior: Behavior) {
        match behavior {
            Behavior::LookingUp => self.u += 1,
            Behavior::LookingDown => self.d += 1,
            Behavior::LyingOnDesk => self.c += 1,
            Behavior::LookingBack => self.b += 1,
            Behavior::UsingPhone => self.p += 1,
            Behavior::Standing => self.s += 1,
        }
    }

    pub fn total(&self) -> u32 {
        self.u + self.d + self.c + self.b + self.p + self.s
    }
}

/// Code → Chinese label legend shipped with every payload.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct BehaviorLegend {
    u: &'static str,
    d: &'static str,
    c: &'static str,
    b: &'static str,
    p: &'static str,
    s: &'static str,
}

impl Default for BehaviorLegend {
    fn default() -> Self {
        Self {
            u: Behavior::LookingUp.label_zh(),
            d: Behavior::LookingDown.label_zh(),
            c: Behavior::LyingOnDesk.label_zh(),
            b: Behavior::LookingBack.label_zh(),
            p: Behavior::UsingPhone.label_zh(),
            s: Behavior::Standing.label_zh(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_keys_map() {
        assert_eq!(Behavior::from_label("LookingUp"), Some(Behavior::LookingUp));
        assert_eq!(Behavior::from_label("LookingDown"), Some(Behavior::LookingDown));
        assert_eq!(Behavior::from_label("LyingOnDesk"), Some(Behavior::LyingOnDesk));
        assert_eq!(Behavior::from_label("LookingBack"), Some(Behavior::LookingBack));
        assert_eq!(Behavior::from_label("UsingPhone"), Some(Behavior::UsingPhone));
        assert_eq!(Behavior::from_label("Standing"), Some(Behavior::Standing));
    }

    #[test]
    fn normalization_strips_case_spaces_and_underscores() {
        assert_eq!(Behavior::from_label("  looking down "), Some(Behavior::LookingDown));
        assert_eq!(Behavior::from_label("using_phone"), Some(Behavior::UsingPhone));
        assert_eq!(Behavior::from_label("LOOKING_UP"), Some(Behavior::LookingUp));
    }

    #[test]
    fn aliases_map_to_canonical_behaviors() {
        assert_eq!(Behavior::from_label("up"), Some(Behavior::LookingUp));
        assert_eq!(Behavior::from_label("raisehead"), Some(Behavior::LookingUp));
        assert_eq!(Behavior::from_label("desk"), Some(Behavior::LyingOnDesk));
        assert_eq!(Behavior::from_label("phone"), Some(Behavior::UsingPhone));
        assert_eq!(Behavior::from_label("stand"), Some(Behavior::Standing));
    }

    #[test]
    fn chinese_labels_match_as_substrings() {
        assert_eq!(Behavior::from_label("低头"), Some(Behavior::LookingDown));
        assert_eq!(Behavior::from_label("学生趴桌"), Some(Behavior::LyingOnDesk));
        assert_eq!(Behavior::from_label("使用手机"), Some(Behavior::UsingPhone));
    }

    #[test]
    fn unrecognized_labels_are_uncategorized() {
        assert_eq!(Behavior::from_label("未知类别"), None);
        assert_eq!(Behavior::from_label("person"), None);
        assert_eq!(Behavior::from_label(""), None);
        assert_eq!(Behavior::from_label("   "), None);
    }

    #[test]
    fn mapping_is_deterministic() {
        for _ in 0..3 {
            assert_eq!(Behavior::from_label("LookingDown"), Some(Behavior::LookingDown));
            assert_eq!(Behavior::from_label("未知类别"), None);
        }
    }

    #[test]
    fn order_and_codes_agree() {
        let codes: Vec<&str> = Behavior::ORDER.iter().map(|b| b.code()).collect();
        assert_eq!(codes, Behavior::CODES);
    }

    #[test]
    fn counts_accumulate_per_code() {
        let mut counts = BehaviorCounts::default();
        counts.record(Behavior::LookingDown);
        counts.record(Behavior::LookingDown);
        counts.record(Behavior::Standing);
        assert_eq!(counts.d, 2);
        assert_eq!(counts.s, 1);
        assert_eq!(counts.u + counts.c + counts.b + counts.p, 0);
        assert_eq!(counts.total(), 3);
    }
}
