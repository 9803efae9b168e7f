//! Parsing and encoding of CIL method-body headers.
//!
//! A method body in the metadata store is stored the way it appears in the image: a tiny or fat
//! header, the IL bytes, and (for fat headers) optional extra data sections carrying exception
//! clauses. [`MethodBody::parse`] splits that byte range back into its parts; the encoder is used
//! by the in-memory store builder.
//!
//! # References
//! - ECMA-335 6th Edition, Partition II, Section 25.4 - Method Header Format

use bitflags::bitflags;

use crate::{
    io::{read_le, read_le_at, write_le_at},
    metadata::{method::ExceptionRegion, method::ExceptionHandlerFlags, token::Token},
    Error::OutOfBounds,
    Result,
};

bitflags! {
    /// Method header flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MethodBodyFlags: u16 {
        /// Tiny header (code size < 64, no locals, no exceptions, max stack 8)
        const TINY_FORMAT = 0x2;
        /// Fat header
        const FAT_FORMAT = 0x3;
        /// Extra data sections follow the code
        const MORE_SECTS = 0x8;
        /// Zero-initialize locals
        const INIT_LOCALS = 0x10;
    }
}

bitflags! {
    /// Extra data section flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectionFlags: u8 {
        /// Exception handling table
        const EHTABLE = 0x1;
        /// Optimized IL table (unused)
        const OPT_ILTABLE = 0x2;
        /// Fat section layout
        const FAT_FORMAT = 0x40;
        /// Another section follows
        const MORE_SECTS = 0x80;
    }
}

/// A method body split into header fields, IL bytes and exception regions.
#[derive(Debug, Clone)]
pub struct MethodBody {
    /// The IL instruction bytes
    pub code: Vec<u8>,
    /// Size of the method header in bytes
    pub size_header: usize,
    /// `StandAloneSig` token describing the locals, null if none
    pub local_var_sig_token: Token,
    /// Maximum number of items on the operand stack
    pub max_stack: usize,
    /// Flag, indicating the type of the method header
    pub is_fat: bool,
    /// Flag, indicating to zero-initialize all local variables
    pub is_init_local: bool,
    /// Exception regions in declaration order
    pub exception_regions: Vec<ExceptionRegion>,
}

impl MethodBody {
    /// Parse a method body starting at its header.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the declared code or sections exceed the data,
    /// or [`crate::Error::Malformed`] for an unknown header format.
    pub fn parse(data: &[u8]) -> Result<MethodBody> {
        if data.is_empty() {
            return Err(malformed_error!("Provided data for body parsing is empty"));
        }

        let first_byte = read_le::<u8>(data)?;
        match MethodBodyFlags::from_bits_truncate(u16::from(first_byte & 0b_0000_0011_u8)) {
            MethodBodyFlags::TINY_FORMAT => {
                let size_code = (first_byte >> 2) as usize;
                if size_code + 1 > data.len() {
                    return Err(OutOfBounds);
                }

                Ok(MethodBody {
                    code: data[1..=size_code].to_vec(),
                    size_header: 1,
                    local_var_sig_token: Token(0),
                    max_stack: 8,
                    is_fat: false,
                    is_init_local: false,
                    exception_regions: Vec::new(),
                })
            }
            MethodBodyFlags::FAT_FORMAT => {
                if data.len() < 12 {
                    return Err(OutOfBounds);
                }

                let first_duo = read_le::<u16>(data)?;
                let size_header = usize::from(first_duo >> 12) * 4;
                let size_code = read_le::<u32>(&data[4..])? as usize;
                let code_end = size_header.checked_add(size_code).ok_or(OutOfBounds)?;
                if size_header < 12 || data.len() < code_end {
                    return Err(OutOfBounds);
                }

                let flags = MethodBodyFlags::from_bits_truncate(first_duo & 0x0FFF);
                let max_stack = usize::from(read_le::<u16>(&data[2..])?);
                let local_var_sig_token = Token(read_le::<u32>(&data[8..])?);

                let exception_regions = if flags.contains(MethodBodyFlags::MORE_SECTS) {
                    Self::parse_sections(data, (code_end + 3) & !3)?
                } else {
                    Vec::new()
                };

                Ok(MethodBody {
                    code: data[size_header..code_end].to_vec(),
                    size_header,
                    local_var_sig_token,
                    max_stack,
                    is_fat: true,
                    is_init_local: flags.contains(MethodBodyFlags::INIT_LOCALS),
                    exception_regions,
                })
            }
            _ => Err(malformed_error!(
                "MethodHeader is neither FAT nor TINY - {}",
                first_byte
            )),
        }
    }

    fn parse_sections(data: &[u8], mut cursor: usize) -> Result<Vec<ExceptionRegion>> {
        let mut regions = Vec::new();

        loop {
            let section_flags = SectionFlags::from_bits_truncate(read_le_at::<u8>(data, &mut cursor)?);
            if !section_flags.contains(SectionFlags::EHTABLE) {
                return Err(malformed_error!(
                    "Unsupported method data section - {:?}",
                    section_flags
                ));
            }

            if section_flags.contains(SectionFlags::FAT_FORMAT) {
                let low = u32::from(read_le_at::<u8>(data, &mut cursor)?);
                let mid = u32::from(read_le_at::<u8>(data, &mut cursor)?);
                let high = u32::from(read_le_at::<u8>(data, &mut cursor)?);
                let size = low | (mid << 8) | (high << 16);
                if size < 4 {
                    return Err(malformed_error!("Fat EH section too small - {}", size));
                }

                for _ in 0..(size - 4) / 24 {
                    #[allow(clippy::cast_possible_truncation)]
                    let flags = ExceptionHandlerFlags::from_bits_truncate(
                        read_le_at::<u32>(data, &mut cursor)? as u16,
                    );
                    regions.push(ExceptionRegion::from_raw(
                        flags,
                        read_le_at::<u32>(data, &mut cursor)?,
                        read_le_at::<u32>(data, &mut cursor)?,
                        read_le_at::<u32>(data, &mut cursor)?,
                        read_le_at::<u32>(data, &mut cursor)?,
                        read_le_at::<u32>(data, &mut cursor)?,
                    ));
                }
            } else {
                let size = u32::from(read_le_at::<u8>(data, &mut cursor)?);
                // reserved
                cursor += 2;
                if size < 4 {
                    return Err(malformed_error!("Small EH section too small - {}", size));
                }

                for _ in 0..(size - 4) / 12 {
                    let flags =
                        ExceptionHandlerFlags::from_bits_truncate(read_le_at::<u16>(data, &mut cursor)?);
                    let try_offset = u32::from(read_le_at::<u16>(data, &mut cursor)?);
                    let try_length = u32::from(read_le_at::<u8>(data, &mut cursor)?);
                    let handler_offset = u32::from(read_le_at::<u16>(data, &mut cursor)?);
                    let handler_length = u32::from(read_le_at::<u8>(data, &mut cursor)?);
                    let class_or_filter = read_le_at::<u32>(data, &mut cursor)?;
                    regions.push(ExceptionRegion::from_raw(
                        flags,
                        try_offset,
                        try_length,
                        handler_offset,
                        handler_length,
                        class_or_filter,
                    ));
                }
            }

            if !section_flags.contains(SectionFlags::MORE_SECTS) {
                return Ok(regions);
            }
            cursor = (cursor + 3) & !3;
        }
    }

    /// Encode IL bytes plus header information into the on-disk body layout.
    ///
    /// A tiny header is chosen when the body qualifies for one; otherwise a fat header is
    /// written, followed by a single fat exception section when `regions` is not empty.
    #[must_use]
    pub fn encode(
        code: &[u8],
        max_stack: u16,
        local_var_sig_token: Token,
        init_locals: bool,
        regions: &[ExceptionRegion],
    ) -> Vec<u8> {
        let tiny = code.len() < 64
            && max_stack <= 8
            && local_var_sig_token.is_null()
            && !init_locals
            && regions.is_empty();

        if tiny {
            #[allow(clippy::cast_possible_truncation)]
            let mut out = vec![((code.len() as u8) << 2) | 0x2];
            out.extend_from_slice(code);
            return out;
        }

        let mut flags = MethodBodyFlags::FAT_FORMAT;
        if init_locals {
            flags |= MethodBodyFlags::INIT_LOCALS;
        }
        if !regions.is_empty() {
            flags |= MethodBodyFlags::MORE_SECTS;
        }

        let code_end = 12 + code.len();
        let section_start = (code_end + 3) & !3;
        let section_size = 4 + regions.len() * 24;
        let total = if regions.is_empty() {
            code_end
        } else {
            section_start + section_size
        };

        let mut out = vec![0u8; total];
        let mut cursor = 0;
        // The buffer is sized above, writes cannot run past it.
        let _ = write_le_at(&mut out, &mut cursor, flags.bits() | (3 << 12));
        let _ = write_le_at(&mut out, &mut cursor, max_stack);
        #[allow(clippy::cast_possible_truncation)]
        let _ = write_le_at(&mut out, &mut cursor, code.len() as u32);
        let _ = write_le_at(&mut out, &mut cursor, local_var_sig_token.value());
        out[12..code_end].copy_from_slice(code);

        if !regions.is_empty() {
            cursor = section_start;
            let _ = write_le_at(
                &mut out,
                &mut cursor,
                (SectionFlags::EHTABLE | SectionFlags::FAT_FORMAT).bits(),
            );
            #[allow(clippy::cast_possible_truncation)]
            let size = section_size as u32;
            out[cursor] = (size & 0xFF) as u8;
            out[cursor + 1] = ((size >> 8) & 0xFF) as u8;
            out[cursor + 2] = ((size >> 16) & 0xFF) as u8;
            cursor += 3;
            for region in regions {
                let (flags, class_or_filter) = region.raw_parts();
                let _ = write_le_at(&mut out, &mut cursor, u32::from(flags.bits()));
                let _ = write_le_at(&mut out, &mut cursor, region.try_offset);
                let _ = write_le_at(&mut out, &mut cursor, region.try_length);
                let _ = write_le_at(&mut out, &mut cursor, region.handler_offset);
                let _ = write_le_at(&mut out, &mut cursor, region.handler_length);
                let _ = write_le_at(&mut out, &mut cursor, class_or_filter);
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::method::ExceptionRegionKind;

    #[test]
    fn tiny() {
        // ldarg.0; ldarg.1; add; ret
        let data = [0x12, 0x02, 0x03, 0x58, 0x2A];
        let body = MethodBody::parse(&data).unwrap();
        assert!(!body.is_fat);
        assert_eq!(body.code, vec![0x02, 0x03, 0x58, 0x2A]);
        assert_eq!(body.size_header, 1);
        assert!(body.local_var_sig_token.is_null());
    }

    #[test]
    fn tiny_truncated() {
        let data = [0x12, 0x02];
        assert!(matches!(MethodBody::parse(&data), Err(OutOfBounds)));
    }

    #[test]
    fn fat_with_small_eh_section() {
        let mut data = vec![
            0x1B, 0x30, // flags: fat | more_sects | init_locals, header size 3 dwords
            0x02, 0x00, // max stack
            0x06, 0x00, 0x00, 0x00, // code size
            0x01, 0x00, 0x00, 0x11, // locals token
            0x00, 0x00, 0xDE, 0x02, 0x00, 0x2A, // nop; nop; leave.s +2; nop; ret
            0x00, 0x00, // padding to 4
        ];
        data.extend_from_slice(&[
            0x01, 0x10, 0x00, 0x00, // small EH section, size 16
            0x02, 0x00, // finally
            0x00, 0x00, 0x04, // try 0..4
            0x04, 0x00, 0x01, // handler 4..5
            0x00, 0x00, 0x00, 0x00,
        ]);

        let body = MethodBody::parse(&data).unwrap();
        assert!(body.is_fat);
        assert!(body.is_init_local);
        assert_eq!(body.max_stack, 2);
        assert_eq!(body.code.len(), 6);
        assert_eq!(body.local_var_sig_token, Token(0x1100_0001));
        assert_eq!(body.exception_regions.len(), 1);
        let region = body.exception_regions[0];
        assert_eq!(region.kind, ExceptionRegionKind::Finally);
        assert_eq!((region.try_offset, region.try_length), (0, 4));
        assert_eq!((region.handler_offset, region.handler_length), (4, 1));
    }

    #[test]
    fn encoder_picks_fat_for_eh() {
        let region = ExceptionRegion::from_raw(ExceptionHandlerFlags::EXCEPTION, 0, 2, 2, 2, 0x0200_0005);
        let bytes = MethodBody::encode(&[0x00, 0x00, 0x26, 0x2A], 4, Token(0), false, &[region]);
        let body = MethodBody::parse(&bytes).unwrap();
        assert!(body.is_fat);
        assert_eq!(body.code, vec![0x00, 0x00, 0x26, 0x2A]);
        assert_eq!(body.exception_regions, vec![region]);
    }

    #[test]
    fn unknown_header_is_malformed() {
        let data = [0x01, 0x00];
        assert!(matches!(MethodBody::parse(&data), Err(crate::Error::Malformed { .. })));
    }
}
