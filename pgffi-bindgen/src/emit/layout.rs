//LICENSE Portions Copyright 2019-2021 ZomboDB, LLC.
//LICENSE
//LICENSE Portions Copyright 2021-2023 Technology Concepts & Design, Inc.
//LICENSE
//LICENSE Portions Copyright 2023-2023 PgCentral Foundation, Inc. <contact@pgcentral.org>
//LICENSE
//LICENSE All rights reserved.
//LICENSE
//LICENSE Use of this source code is governed by the MIT license that can be found in the LICENSE file.
//! Planning a `#[repr(C)]` Rust type whose layout equals a recorded C layout.
//!
//! Every gap C leaves between members becomes an explicit `[u8; N]` padding slot, so Rust
//! never has to agree with C about where padding goes; it only has to agree about the
//! alignment of each real member, which is checked here.
use crate::ir::{Field, RecordDecl};

#[derive(Debug, PartialEq)]
pub(super) enum Slot<'r> {
    Field(&'r Field),
    Pad(u64),
    /// Byte storage for a run of adjacent bit-fields
    Bits { offset: u64, len: u64, members: Vec<&'r Field> },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(super) enum Modifier {
    None,
    Packed(u64),
    Align(u64),
}

#[derive(Debug)]
pub(super) struct Layout<'r> {
    pub slots: Vec<Slot<'r>>,
    pub modifier: Modifier,
}

pub(super) fn plan(rec: &RecordDecl) -> Result<Layout<'_>, String> {
    if !rec.align.is_power_of_two() {
        return Err(format!("alignment {} is not a power of two", rec.align));
    }
    if rec.size % rec.align != 0 {
        return Err(format!("size {} is not a multiple of alignment {}", rec.size, rec.align));
    }
    let (slots, rust_align) = if rec.is_union { union_slots(rec)? } else { struct_slots(rec)? };

    let modifier = match rec.align.cmp(&rust_align) {
        std::cmp::Ordering::Greater => Modifier::Align(rec.align),
        std::cmp::Ordering::Less => Modifier::Packed(rec.align),
        std::cmp::Ordering::Equal => Modifier::None,
    };

    let mut offset = 0;
    for slot in &slots {
        match slot {
            Slot::Field(f) => {
                let align = match modifier {
                    Modifier::Packed(n) => f.align.min(n),
                    _ => f.align,
                };
                if align != 0 && offset % align != 0 {
                    return Err(format!(
                        "`{}` at offset {offset} is not aligned to {align}",
                        f.name
                    ));
                }
                if !rec.is_union {
                    offset += f.size;
                }
            }
            Slot::Pad(n) | Slot::Bits { len: n, .. } if !rec.is_union => offset += n,
            _ => {}
        }
    }
    Ok(Layout { slots, modifier })
}

fn struct_slots(rec: &RecordDecl) -> Result<(Vec<Slot<'_>>, u64), String> {
    let mut slots = Vec::new();
    let mut end = 0;
    let mut rust_align = 1;
    let mut fields = rec.fields.iter().peekable();
    while let Some(field) = fields.next() {
        if let Some(width) = field.bit_width {
            let start_bits = field.offset_bits;
            let mut stop_bits = start_bits + u64::from(width);
            let mut members = vec![field];
            while let Some(next) = fields.next_if(|f| f.bit_width.is_some()) {
                stop_bits = stop_bits.max(next.offset_bits + u64::from(next.bit_width.unwrap_or(0)));
                members.push(next);
            }
            let offset = start_bits / 8;
            let len = stop_bits.div_ceil(8) - offset;
            pad_to(&mut slots, end, offset, &field.name)?;
            slots.push(Slot::Bits { offset, len, members });
            end = offset + len;
            continue;
        }

        if field.offset_bits % 8 != 0 {
            return Err(format!("`{}` does not start on a byte boundary", field.name));
        }
        let offset = field.offset_bits / 8;
        pad_to(&mut slots, end, offset, &field.name)?;
        slots.push(Slot::Field(field));
        end = offset + field.size;
        rust_align = rust_align.max(field.align);
    }

    if end > rec.size {
        return Err(format!("members end at byte {end}, past the size {}", rec.size));
    }
    if end < rec.size {
        slots.push(Slot::Pad(rec.size - end));
    }
    Ok((slots, rust_align))
}

fn pad_to(slots: &mut Vec<Slot<'_>>, end: u64, offset: u64, name: &str) -> Result<(), String> {
    if offset < end {
        return Err(format!("`{name}` at byte {offset} overlaps the previous member"));
    }
    if offset > end {
        slots.push(Slot::Pad(offset - end));
    }
    Ok(())
}

fn union_slots(rec: &RecordDecl) -> Result<(Vec<Slot<'_>>, u64), String> {
    let mut slots = Vec::new();
    let mut largest = 0;
    let mut rust_align = 1;
    for field in &rec.fields {
        if field.offset_bits != 0 {
            return Err(format!("union member `{}` is not at offset 0", field.name));
        }
        match field.bit_width {
            Some(width) => {
                let len = u64::from(width).div_ceil(8);
                largest = largest.max(len);
                slots.push(Slot::Bits { offset: 0, len, members: vec![field] });
            }
            None => {
                largest = largest.max(field.size);
                rust_align = rust_align.max(field.align);
                slots.push(Slot::Field(field));
            }
        }
    }
    if largest > rec.size {
        return Err(format!("a member is larger than the union's size {}", rec.size));
    }
    if largest < rec.size {
        slots.push(Slot::Pad(rec.size));
    }
    Ok((slots, rust_align))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{CType, IntType};

    fn field(name: &str, offset: u64, size: u64) -> Field {
        Field {
            name: name.into(),
            ty: CType::Int(IntType::new((size * 8) as u16, true)),
            offset_bits: offset * 8,
            bit_width: None,
            size,
            align: size,
        }
    }

    fn bits(name: &str, offset_bits: u64, width: u32) -> Field {
        Field {
            name: name.into(),
            ty: CType::Int(IntType::U32),
            offset_bits,
            bit_width: Some(width),
            size: 4,
            align: 4,
        }
    }

    fn record(is_union: bool, size: u64, align: u64, fields: Vec<Field>) -> RecordDecl {
        RecordDecl { is_union, anonymous: false, complete: true, size, align, fields }
    }

    #[test]
    fn explicit_padding() {
        // struct { char c; int i; short s; }
        let rec = record(false, 12, 4, vec![field("c", 0, 1), field("i", 4, 4), field("s", 8, 2)]);
        let layout = plan(&rec).unwrap();
        assert_eq!(layout.modifier, Modifier::None);
        assert_eq!(
            layout.slots,
            [
                Slot::Field(&rec.fields[0]),
                Slot::Pad(3),
                Slot::Field(&rec.fields[1]),
                Slot::Field(&rec.fields[2]),
                Slot::Pad(2),
            ]
        );
    }

    #[test]
    fn bitfield_runs_share_storage() {
        // struct { unsigned a:3, b:9; char c; }  -> size 4, align 4
        let rec = record(false, 4, 4, vec![bits("a", 0, 3), bits("b", 3, 9), field("c", 2, 1)]);
        let layout = plan(&rec).unwrap();
        assert_eq!(layout.modifier, Modifier::Align(4));
        assert_eq!(
            layout.slots,
            [
                Slot::Bits { offset: 0, len: 2, members: vec![&rec.fields[0], &rec.fields[1]] },
                Slot::Field(&rec.fields[2]),
                Slot::Pad(1),
            ]
        );
    }

    #[test]
    fn packed_records() {
        // struct __attribute__((packed)) { char c; int i; }
        let rec = record(false, 5, 1, vec![field("c", 0, 1), field("i", 1, 4)]);
        let layout = plan(&rec).unwrap();
        assert_eq!(layout.modifier, Modifier::Packed(1));
        assert_eq!(layout.slots.len(), 2);
    }

    #[test]
    fn unions_pad_to_their_size() {
        let rec = record(true, 16, 8, vec![field("a", 0, 4), field("b", 0, 8)]);
        let layout = plan(&rec).unwrap();
        assert_eq!(layout.modifier, Modifier::None);
        assert_eq!(layout.slots.last(), Some(&Slot::Pad(16)));
    }

    #[test]
    fn impossible_layouts() {
        let overlap = record(false, 8, 4, vec![field("a", 0, 4), field("b", 2, 4)]);
        assert!(plan(&overlap).unwrap_err().contains("overlaps"));

        let misaligned = record(false, 8, 4, vec![field("a", 0, 2), field("b", 2, 4)]);
        assert!(plan(&misaligned).unwrap_err().contains("not aligned"));

        let mut odd = field("a", 0, 4);
        odd.offset_bits = 4;
        assert!(plan(&record(false, 8, 4, vec![odd])).unwrap_err().contains("byte boundary"));
    }
}
