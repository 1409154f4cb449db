use std::fmt;
use std::str::FromStr;

/// On-screen rectangle that is streamed and that input coordinates map into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureArea {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureAreaError {
    #[error("capture area '{0}' is not of the form WxH+X+Y")]
    Malformed(String),
    #[error("capture area must be at least 2x2, got {0}x{1}")]
    TooSmall(u32, u32),
}

impl CaptureArea {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Round width and height down to even numbers (H.264 encoder requirement).
    pub fn fit_for_h264(self) -> Result<Self, CaptureAreaError> {
        let width = self.width & !1;
        let height = self.height & !1;
        if width == 0 || height == 0 {
            return Err(CaptureAreaError::TooSmall(self.width, self.height));
        }
        Ok(Self {
            width,
            height,
            ..self
        })
    }

    /// Map normalized [0.0, 1.0] coordinates to absolute screen pixels inside
    /// this area. Out-of-range and non-finite inputs are clamped.
    pub fn to_absolute(&self, nx: f64, ny: f64) -> (i32, i32) {
        fn scale(n: f64, extent: u32) -> i32 {
            let n = if n.is_finite() { n.clamp(0.0, 1.0) } else { 0.0 };
            let max = extent.saturating_sub(1) as f64;
            (n * max).round() as i32
        }
        (
            self.x + scale(nx, self.width),
            self.y + scale(ny, self.height),
        )
    }
}

impl fmt::Display for CaptureArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}{:+}{:+}", self.width, self.height, self.x, self.y)
    }
}

/// X11 geometry syntax: `WxH`, `WxH+X+Y`; offsets may be negative (`-X`).
impl FromStr for CaptureArea {
    type Err = CaptureAreaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || CaptureAreaError::Malformed(s.to_string());
        let s = s.trim();

        let split = s.find(['+', '-']).unwrap_or(s.len());
        let (size, offsets) = s.split_at(split);
        let (w, h) = size.split_once(['x', 'X']).ok_or_else(malformed)?;
        let width: u32 = w.parse().map_err(|_| malformed())?;
        let height: u32 = h.parse().map_err(|_| malformed())?;

        let (x, y) = if offsets.is_empty() {
            (0, 0)
        } else {
            // Second sign starts the Y offset.
            let second = offsets[1..]
                .find(['+', '-'])
                .map(|i| i + 1)
                .ok_or_else(malformed)?;
            let (x, y) = offsets.split_at(second);
            (
                x.parse::<i32>().map_err(|_| malformed())?,
                y.parse::<i32>().map_err(|_| malformed())?,
            )
        };

        if width == 0 || height == 0 {
            return Err(CaptureAreaError::TooSmall(width, height));
        }
        Ok(Self::new(x, y, width, height))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_geometry() {
        let area: CaptureArea = "1280x720+100+50".parse().unwrap();
        assert_eq!(area, CaptureArea::new(100, 50, 1280, 720));
    }

    #[test]
    fn parse_without_offset() {
        let area: CaptureArea = "1920x1080".parse().unwrap();
        assert_eq!(area, CaptureArea::new(0, 0, 1920, 1080));
    }

    #[test]
    fn parse_negative_offsets() {
        let area: CaptureArea = "640x480-10-5".parse().unwrap();
        assert_eq!(area, CaptureArea::new(-10, -5, 640, 480));
    }

    #[test]
    fn parse_rejects_garbage() {
        for bad in ["", "1280", "1280x", "x720", "axb+0+0", "1280x720+5", "0x720"] {
            assert!(bad.parse::<CaptureArea>().is_err(), "{bad}");
        }
    }

    #[test]
    fn display_matches_parse() {
        let area = CaptureArea::new(3, -4, 800, 600);
        assert_eq!(area.to_string(), "800x600+3-4");
        assert_eq!(area.to_string().parse::<CaptureArea>().unwrap(), area);
    }

    #[test]
    fn fit_rounds_down_to_even() {
        let area = CaptureArea::new(1, 1, 1281, 721).fit_for_h264().unwrap();
        assert_eq!((area.width, area.height), (1280, 720));
        assert_eq!((area.x, area.y), (1, 1));
        assert!(CaptureArea::new(0, 0, 1, 720).fit_for_h264().is_err());
    }

    #[test]
    fn normalized_coordinates_land_inside_area() {
        let area = CaptureArea::new(100, 50, 1280, 720);
        assert_eq!(area.to_absolute(0.0, 0.0), (100, 50));
        assert_eq!(area.to_absolute(1.0, 1.0), (100 + 1279, 50 + 719));
        assert_eq!(area.to_absolute(0.5, 0.5), (100 + 640, 50 + 360));
        assert_eq!(area.to_absolute(-3.0, 7.0), (100, 50 + 719));
        assert_eq!(area.to_absolute(f64::NAN, 0.0), (100, 50));
    }
}
