use serde::{Deserialize, Serialize};

use crate::{
    device::CHANNEL_COUNT,
    error::{Result, SimError},
};

/// Holding registers available in the backing storage.
pub const REGISTER_CAPACITY: usize = 128;

/// Zero-based holding register layout (offsets from the 40001 base).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterLayout {
    /// Highest accepted address; the window is `0..=max_address`.
    pub max_address: u16,
    /// First per-channel control register (channel 1).
    pub control_base: u16,
    /// First per-channel status register (channel 1).
    pub status_base: u16,
    pub active_count: u16,
    pub active_mask: u16,
}

impl Default for RegisterLayout {
    fn default() -> Self {
        Self {
            max_address: 80,
            control_base: 5,
            status_base: 21,
            active_count: 35,
            active_mask: 36,
        }
    }
}

/// What happens when a register is accessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterBehavior {
    /// Write sets `running` on the unit; read returns the last stored value.
    Control { unit: u8 },
    /// Derived per-channel status bitfield.
    ChannelStatus { unit: u8 },
    ActiveCount,
    ActiveMask,
    /// No side effects.
    Storage,
}

impl RegisterBehavior {
    pub fn is_derived(&self) -> bool {
        matches!(
            self,
            RegisterBehavior::ChannelStatus { .. }
                | RegisterBehavior::ActiveCount
                | RegisterBehavior::ActiveMask
        )
    }
}

/// Address-to-behavior table, built once per server.
#[derive(Debug, Clone)]
pub struct RegisterMap {
    layout: RegisterLayout,
    table: Vec<RegisterBehavior>,
}

impl RegisterMap {
    pub fn new(layout: RegisterLayout) -> Result<Self> {
        if layout.max_address as usize >= REGISTER_CAPACITY {
            return Err(SimError::Config(format!(
                "max_address {} exceeds register storage (0..{REGISTER_CAPACITY})",
                layout.max_address
            )));
        }
        let mut table = vec![RegisterBehavior::Storage; layout.max_address as usize + 1];

        let mut assign = |address: u16, behavior: RegisterBehavior| -> Result<()> {
            let slot = table.get_mut(address as usize).ok_or_else(|| {
                SimError::Config(format!(
                    "register {address} for {behavior:?} lies outside 0..={}",
                    layout.max_address
                ))
            })?;
            if *slot != RegisterBehavior::Storage {
                return Err(SimError::Config(format!(
                    "register {address} mapped twice ({slot:?} and {behavior:?})"
                )));
            }
            *slot = behavior;
            Ok(())
        };

        for idx in 0..CHANNEL_COUNT as u16 {
            let unit = idx as u8 + 1;
            assign(
                layout.control_base.saturating_add(idx),
                RegisterBehavior::Control { unit },
            )?;
            assign(
                layout.status_base.saturating_add(idx),
                RegisterBehavior::ChannelStatus { unit },
            )?;
        }
        assign(layout.active_count, RegisterBehavior::ActiveCount)?;
        assign(layout.active_mask, RegisterBehavior::ActiveMask)?;

        Ok(Self { layout, table })
    }

    /// Check that `count` registers starting at `address` all lie in the window.
    ///
    /// A count of zero is checked as a single register so that out-of-window
    /// starts are always reported as address errors.
    pub fn check_range(&self, address: u16, count: u16) -> Result<()> {
        let last = address as u32 + count.max(1) as u32 - 1;
        if last > self.layout.max_address as u32 {
            return Err(SimError::Address { address, count });
        }
        Ok(())
    }

    /// Behaviors for `count` registers starting at `address`.
    pub fn span(&self, address: u16, count: u16) -> Result<&[RegisterBehavior]> {
        self.check_range(address, count)?;
        let start = address as usize;
        Ok(&self.table[start..start + count as usize])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_map() -> RegisterMap {
        RegisterMap::new(RegisterLayout::default()).unwrap()
    }

    fn behavior(map: &RegisterMap, address: u16) -> RegisterBehavior {
        map.span(address, 1).unwrap()[0]
    }

    #[test]
    fn default_layout_matches_register_table() {
        let map = default_map();
        for unit in 1..=4u8 {
            assert_eq!(
                behavior(&map, 4 + unit as u16),
                RegisterBehavior::Control { unit }
            );
            assert_eq!(
                behavior(&map, 20 + unit as u16),
                RegisterBehavior::ChannelStatus { unit }
            );
        }
        assert_eq!(behavior(&map, 35), RegisterBehavior::ActiveCount);
        assert_eq!(behavior(&map, 36), RegisterBehavior::ActiveMask);
        assert_eq!(behavior(&map, 0), RegisterBehavior::Storage);
        assert_eq!(behavior(&map, 4), RegisterBehavior::Storage);
        assert_eq!(behavior(&map, 9), RegisterBehavior::Storage);
        assert_eq!(behavior(&map, 80), RegisterBehavior::Storage);
    }

    #[test]
    fn window_edges_are_accepted_and_neighbours_rejected() {
        let map = default_map();
        assert!(map.check_range(0, 1).is_ok());
        assert!(map.check_range(80, 1).is_ok());
        assert!(map.check_range(0, 81).is_ok());
        assert!(matches!(
            map.check_range(81, 1),
            Err(SimError::Address { address: 81, .. })
        ));
        assert!(map.check_range(u16::MAX, 1).is_err());
        assert!(map.check_range(80, 2).is_err());
        assert!(map.check_range(1, u16::MAX).is_err());
        assert!(map.span(81, 1).is_err());
    }

    #[test]
    fn overlapping_layouts_are_rejected() {
        let layout = RegisterLayout {
            status_base: 6,
            ..RegisterLayout::default()
        };
        assert!(matches!(RegisterMap::new(layout), Err(SimError::Config(_))));

        let layout = RegisterLayout {
            max_address: 30,
            ..RegisterLayout::default()
        };
        assert!(matches!(RegisterMap::new(layout), Err(SimError::Config(_))));

        let layout = RegisterLayout {
            max_address: 128,
            ..RegisterLayout::default()
        };
        assert!(matches!(RegisterMap::new(layout), Err(SimError::Config(_))));
    }

    #[test]
    fn span_returns_contiguous_behaviors() {
        let map = default_map();
        let span = map.span(34, 3).unwrap();
        assert_eq!(
            span,
            &[
                RegisterBehavior::Storage,
                RegisterBehavior::ActiveCount,
                RegisterBehavior::ActiveMask
            ]
        );
        assert!(span[1].is_derived());
    }
}
