//! The fixed unit pools created on first start

use ward_core::{ResourceUnit, RoomClass, UnitId, UnitKind};

/// Number of general rooms
pub const GENERAL_ROOMS: u32 = 50;
/// Number of ICU rooms
pub const ICU_ROOMS: u32 = 25;
/// Number of ambulances
pub const AMBULANCES: u32 = 5;

/// Comfort class of general room number `n` (1-based)
fn room_class(n: u32) -> RoomClass {
    match n {
        1..=20 => RoomClass::Single,
        21..=40 => RoomClass::Double,
        _ => RoomClass::Deluxe,
    }
}

/// Units of the standard layout, numbered from 1 in seeding order
///
/// General rooms `GEN-1`..`GEN-50` come first, then `ICU-1`..`ICU-25`, then
/// `AMB-1`..`AMB-5`.
pub fn standard_layout() -> Vec<ResourceUnit> {
    let mut units = Vec::with_capacity((GENERAL_ROOMS + ICU_ROOMS + AMBULANCES) as usize);
    let mut next: UnitId = 1;
    let mut push = |kind: UnitKind, label: String| {
        units.push(ResourceUnit::available(next, kind, label));
        next += 1;
    };

    for n in 1..=GENERAL_ROOMS {
        push(UnitKind::GeneralRoom(room_class(n)), format!("GEN-{n}"));
    }
    for n in 1..=ICU_ROOMS {
        push(UnitKind::IcuRoom, format!("ICU-{n}"));
    }
    for n in 1..=AMBULANCES {
        push(UnitKind::Ambulance, format!("AMB-{n}"));
    }
    units
}

#[cfg(test)]
mod tests {
    use ward_core::PoolKind;

    use super::*;

    #[test]
    fn layout_has_fixed_composition() {
        let units = standard_layout();
        let count = |pool| units.iter().filter(|u| u.pool() == pool).count();
        assert_eq!(count(PoolKind::General), 50);
        assert_eq!(count(PoolKind::Icu), 25);
        assert_eq!(count(PoolKind::Ambulance), 5);

        assert_eq!(units[0].label, "GEN-1");
        assert_eq!(units[19].kind, UnitKind::GeneralRoom(RoomClass::Single));
        assert_eq!(units[20].kind, UnitKind::GeneralRoom(RoomClass::Double));
        assert_eq!(units[40].kind, UnitKind::GeneralRoom(RoomClass::Deluxe));
        assert_eq!(units[50].label, "ICU-1");
        assert_eq!(units[79].label, "AMB-5");
        assert!(units.windows(2).all(|w| w[0].id + 1 == w[1].id));
    }
}
