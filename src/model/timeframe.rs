use std::fmt;

/// Chart resolution. Intraday frames are minute counts; day, week, and
/// month map to fixed minute equivalents (1440, 10080, 43200) so bucket
/// arithmetic stays uniform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timeframe {
    M1,
    M3,
    M5,
    M15,
    M30,
    H1,
    H2,
    H4,
    H6,
    H8,
    D1,
    W1,
    MN,
}

impl Timeframe {
    pub const ALL: [Timeframe; 13] = [
        Timeframe::M1,
        Timeframe::M3,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::M30,
        Timeframe::H1,
        Timeframe::H2,
        Timeframe::H4,
        Timeframe::H6,
        Timeframe::H8,
        Timeframe::D1,
        Timeframe::W1,
        Timeframe::MN,
    ];

    pub fn minutes(&self) -> u64 {
        match self {
            Timeframe::M1 => 1,
            Timeframe::M3 => 3,
            Timeframe::M5 => 5,
            Timeframe::M15 => 15,
            Timeframe::M30 => 30,
            Timeframe::H1 => 60,
            Timeframe::H2 => 120,
            Timeframe::H4 => 240,
            Timeframe::H6 => 360,
            Timeframe::H8 => 480,
            Timeframe::D1 => 1_440,
            Timeframe::W1 => 10_080,
            Timeframe::MN => 43_200,
        }
    }

    pub fn duration_secs(&self) -> u64 {
        self.minutes() * 60
    }

    pub fn duration_ms(&self) -> u64 {
        self.minutes() * 60_000
    }

    pub fn from_minutes(minutes: u64) -> Option<Timeframe> {
        Timeframe::ALL.iter().copied().find(|tf| tf.minutes() == minutes)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Timeframe::M1 => "M1",
            Timeframe::M3 => "M3",
            Timeframe::M5 => "M5",
            Timeframe::M15 => "M15",
            Timeframe::M30 => "M30",
            Timeframe::H1 => "H1",
            Timeframe::H2 => "H2",
            Timeframe::H4 => "H4",
            Timeframe::H6 => "H6",
            Timeframe::H8 => "H8",
            Timeframe::D1 => "D1",
            Timeframe::W1 => "W1",
            Timeframe::MN => "MN",
        }
    }

    pub fn from_label(s: &str) -> Option<Timeframe> {
        let upper = s.trim().to_ascii_uppercase();
        Timeframe::ALL.iter().copied().find(|tf| tf.label() == upper)
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
