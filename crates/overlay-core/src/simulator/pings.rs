//! One-way inter-region delays for the `Real` latency model.

use crate::error::SimulatorError;
use crate::peer_descriptor::REGION_COUNT;
use std::time::Duration;

/// Region names, indexed by `PeerDescriptor::region`.
pub const REGION_NAMES: [&str; REGION_COUNT as usize] = [
    "us-east",
    "us-west",
    "canada",
    "brazil",
    "uk",
    "germany",
    "france",
    "sweden",
    "india",
    "singapore",
    "japan",
    "korea",
    "australia",
    "south-africa",
    "uae",
    "hong-kong",
];

/// Milliseconds, symmetric.
#[rustfmt::skip]
const REGION_DELAY_MS: [[u64; REGION_COUNT as usize]; REGION_COUNT as usize] = [
    [  1,  32,   8,  60,  38,  45,  40,  50, 100, 115,  75,  85, 100, 110,  95, 105], //  0 us-east
    [ 32,   1,  11,  88,  70,  78,  73,  85, 115,  85,  50,  60,  70, 140, 120,  75], //  1 us-west
    [  8,  11,   1,  65,  40,  47,  42,  52, 105, 115,  70,  80, 105, 115, 100,  95], //  2 canada
    [ 60,  88,  65,   2,  95, 100,  95, 108, 155, 165, 130, 145, 155, 170, 150, 160], //  3 brazil
    [ 38,  70,  40,  95,   1,   8,   5,  15,  60,  80, 110, 120, 130,  80,  55,  95], //  4 uk
    [ 45,  78,  47, 100,   8,   1,   6,  12,  62,  75, 115, 125, 135,  85,  50,  90], //  5 germany
    [ 40,  73,  42,  95,   5,   6,   1,  15,  65,  78, 112, 122, 140,  85,  55,  92], //  6 france
    [ 50,  85,  52, 108,  15,  12,  15,   1,  70,  85, 125, 130, 145,  95,  60, 100], //  7 sweden
    [100, 115, 105, 155,  60,  62,  65,  70,   1,  30,  60,  65,  75,  95,  15,  45], //  8 india
    [115,  85, 115, 165,  80,  75,  78,  85,  30,   1,  35,  40,  45, 125,  45,  16], //  9 singapore
    [ 75,  50,  70, 130, 110, 115, 112, 125,  60,  35,   1,  16,  55, 150,  75,  25], // 10 japan
    [ 85,  60,  80, 145, 120, 125, 122, 130,  65,  40,  16,   1,  65, 160,  80,  20], // 11 korea
    [100,  70, 105, 155, 130, 135, 140, 145,  75,  45,  55,  65,   1, 140,  75,  55], // 12 australia
    [110, 140, 115, 170,  80,  85,  85,  95,  95, 125, 150, 160, 140,   1,  90, 135], // 13 south-africa
    [ 95, 120, 100, 150,  55,  50,  55,  60,  15,  45,  75,  80,  75,  90,   1,  60], // 14 uae
    [105,  75,  95, 160,  95,  90,  92, 100,  45,  16,  25,  20,  55, 135,  60,   1], // 15 hong-kong
];

/// Validate a region tag, returning its index.
pub fn region_index(region: Option<u32>) -> Result<usize, SimulatorError> {
    match region {
        Some(r) if r < REGION_COUNT => Ok(r as usize),
        other => Err(SimulatorError::InvalidRegion(other)),
    }
}

/// One-way delay between two regions.
pub fn region_delay(source: Option<u32>, target: Option<u32>) -> Result<Duration, SimulatorError> {
    let source = region_index(source)?;
    let target = region_index(target)?;
    Ok(Duration::from_millis(REGION_DELAY_MS[source][target]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matrix_is_symmetric() {
        for a in 0..REGION_COUNT as usize {
            for b in 0..REGION_COUNT as usize {
                assert_eq!(REGION_DELAY_MS[a][b], REGION_DELAY_MS[b][a], "{} / {}", a, b);
            }
        }
    }

    #[test]
    fn test_same_region_is_fastest() {
        for a in 0..REGION_COUNT {
            let local = region_delay(Some(a), Some(a)).unwrap();
            for b in 0..REGION_COUNT {
                assert!(local <= region_delay(Some(a), Some(b)).unwrap());
            }
        }
    }

    #[test]
    fn test_invalid_regions() {
        assert_eq!(
            region_delay(None, Some(0)),
            Err(SimulatorError::InvalidRegion(None))
        );
        assert_eq!(
            region_delay(Some(0), Some(16)),
            Err(SimulatorError::InvalidRegion(Some(16)))
        );
        assert_eq!(
            region_delay(Some(4), Some(5)).unwrap(),
            Duration::from_millis(8)
        );
    }
}
