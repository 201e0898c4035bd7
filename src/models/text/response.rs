// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Result, bail};
use zerocopy::{BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, U32};

use crate::{
    client::pdu_connection::FromBytes,
    models::{
        common::{BasicHeaderSegment, HEADER_LEN, SendingData},
        data_fromat::ZeroCopyType,
        opcode::{BhsOpcode, Opcode, RawBhsOpcode},
        text::common::RawStageFlags,
    },
};

/// BHS for a Text Response PDU (RFC3720 §10.11).
#[repr(C)]
#[derive(Debug, Default, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct TextResponse {
    pub opcode: RawBhsOpcode,         // 0
    pub flags: RawStageFlags,         // 1
    reserved1: [u8; 2],                // 2..3
    pub total_ahs_length: u8,         // 4
    pub data_segment_length: [u8; 3], // 5..7
    reserved2: [u8; 8],                // 8..15
    pub initiator_task_tag: u32,      // 16..19
    pub target_transfer_tag: U32<BigEndian>, // 20..23
    pub stat_sn: U32<BigEndian>,      // 24..27
    pub exp_cmd_sn: U32<BigEndian>,   // 28..31
    pub max_cmd_sn: U32<BigEndian>,   // 32..35
    reserved3: [u8; 12],               // 36..47
}

impl TextResponse {
    #[inline]
    pub fn to_bhs_bytes(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() != HEADER_LEN {
            bail!("buffer length must be {HEADER_LEN}, got {}", buf.len());
        }
        buf.copy_from_slice(self.as_bytes());
        Ok(())
    }

    pub fn from_bhs_bytes(buf: &mut [u8]) -> Result<&mut Self> {
        let hdr = <Self as zerocopy::FromBytes>::mut_from_bytes(buf)
            .map_err(|e| anyhow::anyhow!("failed convert buffer TextResponse: {e}"))?;
        if hdr.opcode.opcode_known() != Some(Opcode::TextResp) {
            anyhow::bail!(
                "TextResponse: invalid opcode 0x{:02x}",
                hdr.opcode.opcode_raw()
            );
        }
        Ok(hdr)
    }
}

impl SendingData for TextResponse {
    #[inline]
    fn get_final_bit(&self) -> bool {
        self.flags.get_final_bit()
    }

    #[inline]
    fn set_final_bit(&mut self) {
        self.flags.set_final_bit();
    }

    #[inline]
    fn get_continue_bit(&self) -> bool {
        self.flags.get_continue_bit()
    }

    #[inline]
    fn set_continue_bit(&mut self) {
        self.flags.set_continue_bit();
    }
}

impl FromBytes for TextResponse {
    fn from_bhs_bytes(bytes: &mut [u8]) -> Result<&mut Self> {
        TextResponse::from_bhs_bytes(bytes)
    }
}

impl BasicHeaderSegment for TextResponse {
    #[inline]
    fn to_bhs_bytes(&self, buf: &mut [u8]) -> Result<()> {
        self.to_bhs_bytes(buf)
    }

    #[inline]
    fn get_opcode(&self) -> Result<BhsOpcode> {
        BhsOpcode::try_from(self.opcode.raw())
    }

    #[inline]
    fn get_initiator_task_tag(&self) -> u32 {
        self.initiator_task_tag
    }

    #[inline]
    fn get_ahs_length_bytes(&self) -> usize {
        (self.total_ahs_length as usize) * 4
    }

    #[inline]
    fn set_ahs_length_bytes(&mut self, len: u8) {
        self.total_ahs_length = len >> 2;
    }

    #[inline]
    fn get_data_length_bytes(&self) -> usize {
        u32::from_be_bytes([
            0,
            self.data_segment_length[0],
            self.data_segment_length[1],
            self.data_segment_length[2],
        ]) as usize
    }

    #[inline]
    fn set_data_length_bytes(&mut self, len: u32) {
        let be = len.to_be_bytes();
        self.data_segment_length = [be[1], be[2], be[3]];
    }

    #[inline]
    fn get_header_diggest(&self, _: bool) -> usize {
        0
    }

    #[inline]
    fn get_data_diggest(&self, _: bool) -> usize {
        0
    }
}

impl ZeroCopyType for TextResponse {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::opcode::RawBhsOpcode;

    #[test]
    fn text_response_roundtrips_through_bhs_bytes() {
        let mut buf = [0u8; HEADER_LEN];
        let mut opcode = RawBhsOpcode::default();
        opcode.set_opcode_known(Opcode::TextResp);

        let mut header = TextResponse {
            opcode,
            ..Default::default()
        };
        header.flags.set_final_bit();
        header.initiator_task_tag = 7;
        header.target_transfer_tag.set(0xFFFF_FFFF);
        header.stat_sn.set(42);
        header.exp_cmd_sn.set(43);
        header.max_cmd_sn.set(50);
        header.to_bhs_bytes(&mut buf).unwrap();

        let parsed = TextResponse::from_bhs_bytes(&mut buf).unwrap();
        assert_eq!(parsed.initiator_task_tag, 7);
        assert_eq!(parsed.target_transfer_tag.get(), 0xFFFF_FFFF);
        assert_eq!(parsed.stat_sn.get(), 42);
        assert!(parsed.get_final_bit());
    }
}
