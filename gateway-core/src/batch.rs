//! Batch Read Planner: a pure function that groups Modbus tags into the
//! smallest set of register reads that respect the protocol's per-request
//! register limit and a configurable maximum address gap.

use uuid::Uuid;

use crate::model::{RegisterType, Tag, TagAddress};

#[derive(Debug, Clone)]
pub struct BatchReadConfig {
    pub enabled: bool,
    pub max_gap: u16,
    pub max_registers: u16,
}

impl Default for BatchReadConfig {
    fn default() -> Self {
        Self { enabled: true, max_gap: 10, max_registers: 125 }
    }
}

/// One tag's placement inside a batch: byte/register offset and length
/// within the raw response so the adapter can slice it back out.
#[derive(Debug, Clone)]
pub struct BatchMember {
    pub tag_id: Uuid,
    pub offset: u16,
    pub length: u16,
}

#[derive(Debug, Clone)]
pub struct ReadBatch {
    pub register_type: RegisterType,
    pub unit_id: u8,
    pub start_address: u16,
    pub length: u16,
    pub members: Vec<BatchMember>,
}

impl ReadBatch {
    /// `raw[offset..offset+length]` is this member's slice of the
    /// device's response.
    pub fn slice_of<'a, T>(&self, raw: &'a [T], member: &BatchMember) -> &'a [T] {
        let start = member.offset as usize;
        let end = start + member.length as usize;
        &raw[start..end]
    }
}

struct Candidate<'a> {
    tag: &'a Tag,
    register_type: RegisterType,
    unit_id: u8,
    address: u16,
    length: u16,
}

/// Group enabled Modbus tags into minimal batches. When batching
/// is disabled, every tag becomes its own single-member batch.
pub fn plan_reads(tags: &[Tag], config: &BatchReadConfig, default_unit_id: u8) -> Vec<ReadBatch> {
    let mut candidates: Vec<Candidate> = tags
        .iter()
        .filter(|t| t.enabled)
        .filter_map(|t| match &t.address {
            TagAddress::Modbus(addr) => Some(Candidate {
                tag: t,
                register_type: addr.register_type,
                unit_id: addr.unit_id.unwrap_or(default_unit_id),
                address: addr.address,
                length: addr.length,
            }),
            _ => None,
        })
        .collect();

    if !config.enabled {
        return candidates
            .into_iter()
            .map(|c| ReadBatch {
                register_type: c.register_type,
                unit_id: c.unit_id,
                start_address: c.address,
                length: c.length,
                members: vec![BatchMember { tag_id: c.tag.id, offset: 0, length: c.length }],
            })
            .collect();
    }

    candidates.sort_by_key(|c| (register_type_key(c.register_type), c.unit_id, c.address));

    let mut batches: Vec<ReadBatch> = Vec::new();
    let mut current: Option<(RegisterType, u8, ReadBatch)> = None;

    for c in candidates {
        let fits_current = current.as_ref().is_some_and(|(rt, uid, batch)| {
            *rt == c.register_type
                && *uid == c.unit_id
                && c.address >= batch.start_address + batch.length
                && (c.address - (batch.start_address + batch.length)) <= config.max_gap
                && (c.address + c.length - batch.start_address) <= config.max_registers
        });

        if fits_current {
            let (_, _, batch) = current.as_mut().unwrap();
            let offset = c.address - batch.start_address;
            batch.length = offset + c.length;
            batch.members.push(BatchMember { tag_id: c.tag.id, offset, length: c.length });
        } else {
            if let Some((_, _, batch)) = current.take() {
                batches.push(batch);
            }
            current = Some((
                c.register_type,
                c.unit_id,
                ReadBatch {
                    register_type: c.register_type,
                    unit_id: c.unit_id,
                    start_address: c.address,
                    length: c.length,
                    members: vec![BatchMember { tag_id: c.tag.id, offset: 0, length: c.length }],
                },
            ));
        }
    }
    if let Some((_, _, batch)) = current {
        batches.push(batch);
    }
    batches
}

fn register_type_key(rt: RegisterType) -> u8 {
    match rt {
        RegisterType::Holding => 0,
        RegisterType::Input => 1,
        RegisterType::Coil => 2,
        RegisterType::Discrete => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DataType, ModbusAddress};

    fn tag(address: u16, length: u16) -> Tag {
        Tag {
            id: Uuid::new_v4(),
            connection_id: Uuid::nil(),
            name: format!("t{address}"),
            address: TagAddress::Modbus(ModbusAddress {
                register_type: RegisterType::Holding,
                address,
                length,
                unit_id: Some(1),
                byte_order: None,
            }),
            data_type: if length == 1 { DataType::Uint16 } else { DataType::Uint32 },
            enabled: true,
        }
    }

    #[test]
    fn close_tags_merge_but_far_tag_splits() {
        let tags = vec![tag(100, 1), tag(101, 1), tag(104, 2), tag(120, 1)];
        let cfg = BatchReadConfig { enabled: true, max_gap: 10, max_registers: 125 };
        let batches = plan_reads(&tags, &cfg, 1);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].start_address, 100);
        assert_eq!(batches[0].length, 6);
        assert_eq!(batches[0].members.len(), 3);
        assert_eq!(batches[1].start_address, 120);
        assert_eq!(batches[1].length, 1);
        assert_eq!(batches[1].members.len(), 1);
    }

    #[test]
    fn tight_gap_splits_into_three() {
        let tags = vec![tag(100, 1), tag(101, 1), tag(104, 2), tag(120, 1)];
        let cfg = BatchReadConfig { enabled: true, max_gap: 1, max_registers: 125 };
        let batches = plan_reads(&tags, &cfg, 1);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].start_address, 100);
        assert_eq!(batches[0].length, 2);
        assert_eq!(batches[1].start_address, 104);
        assert_eq!(batches[1].length, 2);
        assert_eq!(batches[2].start_address, 120);
        assert_eq!(batches[2].length, 1);
    }

    #[test]
    fn disabled_batching_yields_one_batch_per_tag() {
        let tags = vec![tag(100, 1), tag(200, 1)];
        let cfg = BatchReadConfig { enabled: false, max_gap: 10, max_registers: 125 };
        let batches = plan_reads(&tags, &cfg, 1);
        assert_eq!(batches.len(), 2);
    }

    #[test]
    fn respects_max_registers() {
        let tags = vec![tag(0, 100), tag(100, 100)];
        let cfg = BatchReadConfig { enabled: true, max_gap: 10, max_registers: 125 };
        let batches = plan_reads(&tags, &cfg, 1);
        assert_eq!(batches.len(), 2);
    }

    #[test]
    fn covers_every_tag_exactly_once() {
        let tags = vec![tag(0, 1), tag(5, 1), tag(50, 2), tag(500, 1)];
        let cfg = BatchReadConfig::default();
        let batches = plan_reads(&tags, &cfg, 1);
        let covered: std::collections::HashSet<Uuid> =
            batches.iter().flat_map(|b| b.members.iter().map(|m| m.tag_id)).collect();
        let expected: std::collections::HashSet<Uuid> = tags.iter().map(|t| t.id).collect();
        assert_eq!(covered, expected);
        for b in &batches {
            assert!(b.length <= cfg.max_registers);
        }
    }
}
