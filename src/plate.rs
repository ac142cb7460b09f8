//! Multi-well plate geometry and navigation.

use crate::error::ScopeError;
use crate::stage::StageController;
use crate::types::{Axis, StagePosition};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Layout of a well plate in stage coordinates (mm).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WellPlate {
    pub rows: u8,
    pub columns: u8,
    pub row_spacing_mm: f64,
    pub column_spacing_mm: f64,
    /// X of column 1
    pub offset_column_1_mm: f64,
    /// Y of row A
    pub offset_row_a_mm: f64,
}

impl Default for WellPlate {
    fn default() -> Self {
        Self {
            rows: 8,
            columns: 12,
            row_spacing_mm: 9.0,
            column_spacing_mm: 9.0,
            offset_column_1_mm: 20.0,
            offset_row_a_mm: 20.0,
        }
    }
}

/// Zero-based well address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Well {
    pub row: u8,
    pub column: u8,
}

impl fmt::Display for Well {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let column = u16::from(self.column) + 1;
        if self.row < 26 {
            write!(f, "{}{}", char::from(b'A' + self.row), column)
        } else {
            // past Z there is no letter
            write!(f, "R{}C{}", u16::from(self.row) + 1, column)
        }
    }
}

impl FromStr for Well {
    type Err = ScopeError;

    /// Parse names such as `B3` or `h12`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ScopeError::InvalidPayload(format!("invalid well name '{s}'"));
        let mut chars = s.trim().chars();
        let letter = chars.next().filter(|c| c.is_ascii_alphabetic()).ok_or_else(invalid)?;
        let number: u8 = chars.as_str().parse().map_err(|_| invalid())?;
        if number == 0 {
            return Err(invalid());
        }
        Ok(Well {
            row: letter.to_ascii_uppercase() as u8 - b'A',
            column: number - 1,
        })
    }
}

impl WellPlate {
    pub fn contains(&self, well: Well) -> bool {
        well.row < self.rows && well.column < self.columns
    }

    /// Stage X/Y of the well center
    pub fn center(&self, well: Well) -> Result<(f64, f64), ScopeError> {
        if !self.contains(well) {
            return Err(ScopeError::InvalidPayload(format!(
                "well {well} is outside the {}x{} plate",
                self.rows, self.columns
            )));
        }
        Ok((
            self.offset_column_1_mm + well.column as f64 * self.column_spacing_mm,
            self.offset_row_a_mm + well.row as f64 * self.row_spacing_mm,
        ))
    }

    /// Well whose center is closest to a stage position, if it lies on the plate
    pub fn nearest_well(&self, position: &StagePosition) -> Option<Well> {
        let column = ((position.x - self.offset_column_1_mm) / self.column_spacing_mm).round();
        let row = ((position.y - self.offset_row_a_mm) / self.row_spacing_mm).round();
        if column < 0.0 || row < 0.0 || column >= self.columns as f64 || row >= self.rows as f64 {
            return None;
        }
        Some(Well {
            row: row as u8,
            column: column as u8,
        })
    }

    /// Move the stage over the center of a well, X then Y
    pub fn move_to_well(&self, stage: &mut StageController, well: Well) -> Result<StagePosition, ScopeError> {
        let (x, y) = self.center(well)?;
        log::info!("Moving to well {well} at ({x:.3}, {y:.3}) mm");
        stage.move_to(Axis::X, x)?;
        stage.move_to(Axis::Y, y)
    }

    pub fn validate(&self) -> Result<(), ScopeError> {
        if self.rows == 0 || self.rows > 26 || self.columns == 0 {
            return Err(ScopeError::Configuration(format!(
                "plate must have 1..=26 rows and at least one column, got {}x{}",
                self.rows, self.columns
            )));
        }
        if self.row_spacing_mm <= 0.0 || self.column_spacing_mm <= 0.0 {
            return Err(ScopeError::Configuration(
                "well spacing must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{DeviceLink, LinkConfig};
    use crate::simulator::SimulatedController;
    use crate::stage::StageConfig;

    #[test]
    fn test_well_names() {
        let well: Well = "B3".parse().unwrap();
        assert_eq!(well, Well { row: 1, column: 2 });
        assert_eq!(well.to_string(), "B3");
        assert_eq!("h12".parse::<Well>().unwrap().to_string(), "H12");
        assert!("3B".parse::<Well>().is_err());
        assert!("A0".parse::<Well>().is_err());
    }

    #[test]
    fn test_well_names_past_z() {
        assert_eq!(Well { row: 25, column: 0 }.to_string(), "Z1");
        assert_eq!(Well { row: 26, column: 1 }.to_string(), "R27C2");
        assert_eq!(Well { row: 255, column: 255 }.to_string(), "R256C256");
    }

    #[test]
    fn test_centers_and_nearest() {
        let plate = WellPlate::default();
        assert_eq!(plate.center(Well { row: 0, column: 0 }).unwrap(), (20.0, 20.0));
        assert_eq!(plate.center("H12".parse().unwrap()).unwrap(), (119.0, 83.0));
        assert!(plate.center("I1".parse().unwrap()).is_err());

        let near_c4 = StagePosition { x: 47.2, y: 38.1, ..Default::default() };
        assert_eq!(plate.nearest_well(&near_c4).map(|w| w.to_string()), Some("C4".to_string()));
        let off_plate = StagePosition { x: 5.0, y: 20.0, ..Default::default() };
        assert_eq!(plate.nearest_well(&off_plate), None);
    }

    #[test]
    fn test_move_to_well() {
        let link = DeviceLink::new(
            Box::new(SimulatedController::new()),
            LinkConfig { poll_interval_ms: 1, ..LinkConfig::default() },
        );
        let mut stage = StageController::new(link, &StageConfig::default());
        let plate = WellPlate::default();

        let position = plate.move_to_well(&mut stage, "B2".parse().unwrap()).unwrap();
        assert!((position.x - 29.0).abs() < 1e-9);
        assert!((position.y - 29.0).abs() < 1e-9);
        assert_eq!(plate.nearest_well(&position), Some(Well { row: 1, column: 1 }));
    }
}
