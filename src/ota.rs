//! Over-the-air firmware updates through the otadata partition
//!
//! `otadata` holds two 32-byte records at the start of its first two
//! blocks. Each record is `{seq: u32, label: [u8; 20], state: u32,
//! crc: u32}` little-endian; the bootloader boots the slot selected by the
//! highest CRC-valid sequence number, slot = (seq - 1) mod n_slots.

use std::{fs, path::Path};

use crc::{Algorithm, Crc};
use log::{debug, info, warn};

use crate::{
    error::{Error, ResultExt},
    firmware::Firmware,
    image_format::ImageHeader,
    partition_table::{DataType, Partition, SubType, Type},
    progress::ProgressCallbacks,
};

pub const OTA_RECORD_SIZE: usize = 0x20;
/// Offsets of the two records inside the otadata partition.
const OTA_RECORD_OFFSETS: [u64; 2] = [0, 0x1000];
const ERASED_SEQ: u32 = 0xFFFF_FFFF;

/// The `state` field of an otadata record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum OtaState {
    /// Written, boots once; rolls back unless marked valid.
    New = 0,
    Pending = 1,
    Valid = 2,
    Invalid = 3,
    Aborted = 4,
    /// Rollback not in use.
    Undefined = ERASED_SEQ,
}

/// The checksum over `ota_seq` uses the zlib CRC-32 seeded with an all-ones
/// previous value, which amounts to a zeroed start register with the usual
/// reflected polynomial and final inversion.
const OTA_SEQ_CRC: Algorithm<u32> = Algorithm {
    width: 32,
    poly: 0x04c1_1db7,
    init: 0,
    refin: true,
    refout: true,
    xorout: 0xffff_ffff,
    check: 0,
    residue: 0,
};

pub fn ota_crc(seq: u32) -> u32 {
    Crc::<u32>::new(&OTA_SEQ_CRC).checksum(&seq.to_le_bytes())
}

/// One boot-selection record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OtaRecord {
    pub seq: u32,
    pub state: u32,
    pub crc: u32,
}

impl OtaRecord {
    pub fn from_bytes(data: &[u8]) -> Self {
        OtaRecord {
            seq: u32::from_le_bytes(data[0..4].try_into().unwrap()),
            state: u32::from_le_bytes(data[24..28].try_into().unwrap()),
            crc: u32::from_le_bytes(data[28..32].try_into().unwrap()),
        }
    }

    pub fn to_bytes(seq: u32, state: OtaState) -> [u8; OTA_RECORD_SIZE] {
        let mut out = [0xFFu8; OTA_RECORD_SIZE];
        if seq >= 1 {
            out[0..4].copy_from_slice(&seq.to_le_bytes());
            out[24..28].copy_from_slice(&(state as u32).to_le_bytes());
            out[28..32].copy_from_slice(&ota_crc(seq).to_le_bytes());
        }
        out
    }

    /// A record selects a slot when its sequence is not erased and the CRC
    /// matches. The state only encodes the rollback request.
    pub fn is_valid(&self) -> bool {
        self.seq != ERASED_SEQ && self.seq != 0 && self.crc == ota_crc(self.seq)
    }

    /// The sequence number this record contributes, 0 when invalid.
    pub fn seq_or_zero(&self) -> u32 {
        if self.is_valid() {
            self.seq
        } else {
            0
        }
    }
}

/// Drives an OTA update against an open firmware device.
pub struct OtaUpdater<'a> {
    firmware: &'a mut Firmware,
    otadata: Partition,
    slots: Vec<Partition>,
    seq: u32,
    no_rollback: bool,
}

impl<'a> OtaUpdater<'a> {
    pub fn new(firmware: &'a mut Firmware, no_rollback: bool) -> Result<Self, Error> {
        let otadata = firmware
            .table()
            .find_by_subtype(Type::Data, SubType::Data(DataType::Ota))
            .ok_or_else(|| Error::NotFound("otadata".into()))?
            .clone();

        let slots: Vec<Partition> = firmware.table().ota_parts().into_iter().cloned().collect();
        if slots.len() < 2 {
            return Err(Error::User(
                "OTA updates require at least the 'ota_0' and 'ota_1' partitions".into(),
            ));
        }
        for (i, slot) in slots.iter().enumerate() {
            if slot.sub_type().as_u8() != 0x10 + i as u8 {
                return Err(Error::User(
                    "OTA partition subtypes must be sequential, starting at 'ota_0'".into(),
                ));
            }
        }

        let mut records = [OtaRecord { seq: 0, state: 0, crc: 0 }; 2];
        {
            let mut part = firmware.partition(&otadata.name().to_string())?;
            for (record, offset) in records.iter_mut().zip(OTA_RECORD_OFFSETS) {
                *record = OtaRecord::from_bytes(&part.read(offset, OTA_RECORD_SIZE)?);
                debug!(
                    "OTA record at {offset:#x}: seq={} state={:#x} valid={}",
                    record.seq,
                    record.state,
                    record.is_valid()
                );
            }
        }
        let seq = records.iter().map(OtaRecord::seq_or_zero).max().unwrap_or(0);

        Ok(OtaUpdater {
            firmware,
            otadata,
            slots,
            seq,
            no_rollback,
        })
    }

    /// Current boot sequence number (0 when otadata is erased).
    pub fn seq(&self) -> u32 {
        self.seq
    }

    fn slot_for(&self, seq: u32) -> &Partition {
        let n = if seq > 0 {
            (seq as usize - 1) % self.slots.len()
        } else {
            0
        };
        &self.slots[n]
    }

    /// The slot the bootloader currently selects.
    pub fn current(&self) -> &Partition {
        self.slot_for(self.seq)
    }

    /// The slot the next update goes to.
    pub fn next_update(&self) -> &Partition {
        self.slot_for(self.seq + 1)
    }

    /// Write the app image in `path` to the inactive slot and flip the
    /// boot selection to it. The active slot is never written.
    pub fn update(
        &mut self,
        path: &Path,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error> {
        let display = path.display().to_string();
        let data = fs::read(path).at_path(&display)?;
        let header = ImageHeader::from_bytes(&data)?;
        if header.chip_name() != self.firmware.header().chip_name() {
            return Err(Error::InvalidImage(format!(
                "app image chip type ({}) does not match the device ({})",
                header.chip_name(),
                self.firmware.header().chip_name()
            )));
        }

        let slot = self.next_update().clone();
        if data.len() as u64 > slot.size() as u64 {
            return Err(Error::InvalidImage(format!(
                "app image ({:#x} bytes) does not fit OTA partition '{}' ({:#x} bytes)",
                data.len(),
                slot.name(),
                slot.size()
            )));
        }

        info!("Writing firmware to OTA partition {}...", slot.name());
        {
            let mut part = self.firmware.partition(slot.name())?;
            part.write(0, &data, progress)?;
            part.truncate(data.len() as u64)?;
        }

        info!("Updating otadata partition...");
        self.set_boot(&slot)
    }

    /// Select `slot` for the next boot by writing a new otadata record
    /// with the next sequence number. The record holding the previous
    /// sequence is rewritten last.
    pub fn set_boot(&mut self, slot: &Partition) -> Result<(), Error> {
        let start = self.seq;
        let mut seq = start;
        while self.slot_for(seq).name() != slot.name() {
            seq += 1;
            if seq - start > self.slots.len() as u32 {
                return Err(Error::NotFound(format!(
                    "'{}' is not an OTA partition",
                    slot.name()
                )));
            }
        }
        if seq == start {
            warn!("'{}' is already selected for booting", slot.name());
            return Ok(());
        }

        let state = if self.no_rollback {
            OtaState::Undefined
        } else {
            OtaState::New
        };
        let mut data = vec![0xFFu8; 0x2000];
        data[..OTA_RECORD_SIZE].copy_from_slice(&OtaRecord::to_bytes(seq, state));
        data[0x1000..0x1000 + OTA_RECORD_SIZE]
            .copy_from_slice(&OtaRecord::to_bytes(start, OtaState::Valid));

        let mut part = self.firmware.partition(&self.otadata.name().to_string())?;
        part.write(0, &data, &mut crate::progress::NoProgress)?;
        part.truncate(data.len() as u64)?;
        drop(part);

        self.seq = seq;
        Ok(())
    }
}

/// Update the app firmware on an OTA-enabled device over the serial
/// interface. The new image boots once and rolls back unless it marks
/// itself valid, or permanently when `no_rollback` is set.
pub fn ota_update(
    firmware: &mut Firmware,
    path: &Path,
    no_rollback: bool,
    progress: &mut dyn ProgressCallbacks,
) -> Result<(), Error> {
    if !firmware.is_device() {
        return Err(Error::User(
            "OTA updates require a serial-attached device".into(),
        ));
    }
    let mut updater = OtaUpdater::new(firmware, no_rollback)?;
    updater.update(path, progress)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_matches_record_convention() {
        // Differs from both the plain CRC-32 and its complement
        let crc = ota_crc(1);
        assert_ne!(crc, crc32_iso(&1u32.to_le_bytes()));
        // A record round-trips through its byte form
        let bytes = OtaRecord::to_bytes(7, OtaState::Valid);
        let record = OtaRecord::from_bytes(&bytes);
        assert_eq!(record.seq, 7);
        assert_eq!(record.state, OtaState::Valid as u32);
        assert!(record.is_valid());
    }

    fn crc32_iso(data: &[u8]) -> u32 {
        Crc::<u32>::new(&crc::CRC_32_ISO_HDLC).checksum(data)
    }

    #[test]
    fn erased_and_corrupt_records_are_invalid() {
        let erased = OtaRecord::from_bytes(&[0xFF; OTA_RECORD_SIZE]);
        assert!(!erased.is_valid());
        assert_eq!(erased.seq_or_zero(), 0);

        let mut bytes = OtaRecord::to_bytes(5, OtaState::Valid);
        bytes[28] ^= 0xFF;
        assert!(!OtaRecord::from_bytes(&bytes).is_valid());
    }

    #[test]
    fn zero_seq_record_is_erased_bytes() {
        assert_eq!(OtaRecord::to_bytes(0, OtaState::Valid), [0xFF; OTA_RECORD_SIZE]);
    }
}
