//! Expected submodule catalogue and the frame layout derived from it.
//!
//! Placements are assigned in declaration order. Every IOData entry
//! advances the running frame offset by `data_length + 1`, reserving the
//! IOPS byte that trails the data; every IOCS entry advances it by one.
//! A no-IO submodule therefore still occupies one byte of frame.

use crate::codec::VlanTag;
use crate::error::ConfigError;

/// Largest C-SDU the cyclic engine will lay out.
pub const MAX_CSDU_LEN: usize = 1440;

/// Subslot number carried by zero-length Device Access Point entries.
pub const DAP_SLOT: u16 = 0;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SlotDirection {
    Input,
    Output,
    None,
}

/// One catalogue line from the RTU configuration.
#[derive(Debug, Clone)]
pub struct SlotEntry {
    pub slot: u16,
    pub subslot: u16,
    pub module_ident: u32,
    pub submodule_ident: u32,
    pub direction: SlotDirection,
    pub data_bytes: u16,
}

/// An expected submodule inside a slot.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpectedSubmodule {
    pub subslot: u16,
    pub submodule_ident: u32,
    pub direction: SlotDirection,
    pub data_length: u16,
}

impl ExpectedSubmodule {
    /// A submodule that carries no process data and receives an IOPS-only
    /// frame position.
    #[inline]
    pub fn no_io(&self) -> bool {
        self.data_length == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExpectedSlot {
    pub slot: u16,
    pub module_ident: u32,
    pub submodules: Vec<ExpectedSubmodule>,
}

/// The nested structure transmitted in the Connect request:
/// API -> slot -> subslot -> data description.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpectedCatalogue {
    pub api: u32,
    pub slots: Vec<ExpectedSlot>,
}

impl ExpectedCatalogue {
    /// Groups catalogue lines by slot, preserving declaration order.
    pub fn from_entries(api: u32, entries: &[SlotEntry]) -> Result<ExpectedCatalogue, ConfigError> {
        if entries.is_empty() {
            return Err(ConfigError::EmptyCatalogue);
        }

        let mut slots: Vec<ExpectedSlot> = Vec::new();

        for entry in entries {
            let submodule = ExpectedSubmodule {
                subslot: entry.subslot,
                submodule_ident: entry.submodule_ident,
                direction: entry.direction,
                data_length: entry.data_bytes,
            };

            match slots.last_mut() {
                Some(slot) if slot.slot == entry.slot => slot.submodules.push(submodule),
                _ => slots.push(ExpectedSlot {
                    slot: entry.slot,
                    module_ident: entry.module_ident,
                    submodules: vec![submodule],
                }),
            }
        }

        Ok(ExpectedCatalogue { api, slots })
    }

    /// The catalogue restricted to the Device Access Point slot, used by
    /// the DAP-only connect scope.
    pub fn dap_only(&self) -> ExpectedCatalogue {
        ExpectedCatalogue {
            api: self.api,
            slots: self
                .slots
                .iter()
                .filter(|slot| slot.slot == DAP_SLOT)
                .cloned()
                .collect(),
        }
    }

    pub fn submodule_count(&self) -> usize {
        self.slots.iter().map(|slot| slot.submodules.len()).sum()
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum IocrDirection {
    Input,
    Output,
}

impl IocrDirection {
    /// IOCRType field value.
    #[inline]
    pub fn wire_value(self) -> u16 {
        match self {
            IocrDirection::Input => 1,
            IocrDirection::Output => 2,
        }
    }
}

/// An IOData position: `data_length` bytes of process data followed by the
/// provider status byte at `iops_offset`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Placement {
    pub slot: u16,
    pub subslot: u16,
    pub data_offset: u16,
    pub data_length: u16,
    pub iops_offset: u16,
}

impl Placement {
    /// Occupied interval inside the C-SDU, IOPS byte included.
    #[inline]
    pub fn interval(&self) -> (u16, u16) {
        (self.data_offset, self.iops_offset + 1)
    }
}

/// An IOCS position: a single consumer status byte.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct StatusPlacement {
    pub slot: u16,
    pub subslot: u16,
    pub offset: u16,
}

/// The computed frame layout of one IOCR.
#[derive(Debug, Clone, PartialEq)]
pub struct IocrLayout {
    pub direction: IocrDirection,
    pub frame_id: u16,
    pub vlan: VlanTag,
    /// IOData entries in declaration order.
    pub data: Vec<Placement>,
    /// IOCS entries in declaration order.
    pub status: Vec<StatusPlacement>,
    /// Occupied C-SDU bytes before minimum-length padding.
    pub csdu_len: u16,
}

impl IocrLayout {
    pub fn placement(&self, slot: u16, subslot: u16) -> Option<&Placement> {
        self.data
            .iter()
            .find(|p| p.slot == slot && p.subslot == subslot)
    }

    /// Verifies that IOData intervals are pairwise disjoint and that IOCS
    /// bytes collide with nothing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut intervals: Vec<(u16, u16, u16, u16)> = Vec::new();

        for p in &self.data {
            let (start, end) = p.interval();
            intervals.push((start, end, p.slot, p.subslot));
        }
        for s in &self.status {
            intervals.push((s.offset, s.offset + 1, s.slot, s.subslot));
        }

        for i in 0..intervals.len() {
            for j in 0..i {
                let (a_start, a_end, ..) = intervals[j];
                let (b_start, b_end, slot, subslot) = intervals[i];

                if a_start < b_end && b_start < a_end {
                    return Err(ConfigError::OverlappingPlacements {
                        slot,
                        subslot,
                        offset: b_start,
                    });
                }
            }
        }

        if usize::from(self.csdu_len) > MAX_CSDU_LEN {
            return Err(ConfigError::FrameTooLarge {
                bytes: usize::from(self.csdu_len),
                limit: MAX_CSDU_LEN,
            });
        }

        Ok(())
    }
}

/// The input/output layout pair of one AR.
#[derive(Debug, Clone, PartialEq)]
pub struct IocrPair {
    pub input: IocrLayout,
    pub output: IocrLayout,
}

/// Computes both IOCR layouts for a catalogue.
///
/// Direction rules: input and no-IO submodules are IOData in the input IOCR
/// and IOCS in the output IOCR; output submodules are IOData in the output
/// IOCR and IOCS in the input IOCR. A submodule is never IOData and IOCS in
/// the same IOCR.
pub fn build_layouts(
    catalogue: &ExpectedCatalogue,
    input_frame_id: u16,
    output_frame_id: u16,
) -> Result<IocrPair, ConfigError> {
    let mut input = IocrLayout {
        direction: IocrDirection::Input,
        frame_id: input_frame_id,
        vlan: VlanTag::RT_CLASS1,
        data: Vec::new(),
        status: Vec::new(),
        csdu_len: 0,
    };

    let mut output = IocrLayout {
        direction: IocrDirection::Output,
        frame_id: output_frame_id,
        vlan: VlanTag::RT_CLASS1,
        data: Vec::new(),
        status: Vec::new(),
        csdu_len: 0,
    };

    let mut input_offset: u16 = 0;
    let mut output_offset: u16 = 0;

    for slot in &catalogue.slots {
        for submodule in &slot.submodules {
            let consumed_input = matches!(
                submodule.direction,
                SlotDirection::Input | SlotDirection::None
            );

            if consumed_input {
                input.data.push(Placement {
                    slot: slot.slot,
                    subslot: submodule.subslot,
                    data_offset: input_offset,
                    data_length: submodule.data_length,
                    iops_offset: input_offset + submodule.data_length,
                });
                input_offset += submodule.data_length + 1;

                output.status.push(StatusPlacement {
                    slot: slot.slot,
                    subslot: submodule.subslot,
                    offset: output_offset,
                });
                output_offset += 1;
            } else {
                output.data.push(Placement {
                    slot: slot.slot,
                    subslot: submodule.subslot,
                    data_offset: output_offset,
                    data_length: submodule.data_length,
                    iops_offset: output_offset + submodule.data_length,
                });
                output_offset += submodule.data_length + 1;

                input.status.push(StatusPlacement {
                    slot: slot.slot,
                    subslot: submodule.subslot,
                    offset: input_offset,
                });
                input_offset += 1;
            }
        }
    }

    input.csdu_len = input_offset;
    output.csdu_len = output_offset;

    input.validate()?;
    output.validate()?;

    Ok(IocrPair { input, output })
}
