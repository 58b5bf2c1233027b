use std::fmt;

use serde::Serialize;
use tracing::warn;

/// Rotation of the device display.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum Orientation {
    #[default]
    Normal = 0,
    HomeRight = 1,
    HomeTop = 2,
    HomeLeft = 3,
}

impl Orientation {
    pub fn from_value(value: u32) -> Option<Self> {
        match value {
            0 => Some(Orientation::Normal),
            1 => Some(Orientation::HomeRight),
            2 => Some(Orientation::HomeTop),
            3 => Some(Orientation::HomeLeft),
            _ => None,
        }
    }

    pub fn value(self) -> u8 {
        self as u8
    }

    pub fn description(self) -> &'static str {
        match self {
            Orientation::Normal => "Normal",
            Orientation::HomeRight => "HOME key on the right",
            Orientation::HomeTop => "HOME key on the top",
            Orientation::HomeLeft => "HOME key on the left",
        }
    }
}

impl fmt::Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.value(), self.description())
    }
}

/// Reads the orientation from `dumpsys display`.
///
/// Only a valid `DisplayViewport{...}` record carrying orientation,
/// deviceWidth and deviceHeight counts. Anything else is `Normal`.
pub fn parse_orientation(dumpsys: &str) -> Orientation {
    let record = dumpsys.lines().find_map(|line| {
        let start = line.find("DisplayViewport{")?;
        let viewport = &line[start..];
        if !viewport.contains("valid=true") {
            return None;
        }
        let orientation = field_number(viewport, "orientation")?;
        field_number(viewport, "deviceWidth")?;
        field_number(viewport, "deviceHeight")?;
        Some(orientation)
    });

    match record {
        Some(value) => Orientation::from_value(value).unwrap_or_else(|| {
            warn!("Invalid device orientation: {value}, assume it is normal");
            Orientation::Normal
        }),
        None => {
            warn!("Unable to get device orientation, assume it is normal");
            Orientation::Normal
        }
    }
}

/// Value of `key=<digits>` where `key` is a whole field name.
fn field_number(text: &str, key: &str) -> Option<u32> {
    let pattern = format!("{key}=");
    text.match_indices(&pattern).find_map(|(idx, _)| {
        let whole_name = text[..idx]
            .chars()
            .next_back()
            .map_or(true, |c| !c.is_ascii_alphanumeric());
        if !whole_name {
            return None;
        }
        let digits: String = text[idx + pattern.len()..]
            .chars()
            .take_while(char::is_ascii_digit)
            .collect();
        digits.parse().ok()
    })
}
