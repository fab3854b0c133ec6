//! Minimal ELF64 program-header access for mapping attribution.

use crate::PAGE_SIZE;

pub const PT_LOAD: u32 = 1;
pub const PF_X: u32 = 1;
pub const PF_W: u32 = 2;
pub const PF_R: u32 = 4;

/// One ELF64 program header, the fields attribution needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Phdr {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
}

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

fn read_u16(data: &[u8], off: usize) -> Option<u16> {
    Some(u16::from_le_bytes(data.get(off..off + 2)?.try_into().ok()?))
}

fn read_u32(data: &[u8], off: usize) -> Option<u32> {
    Some(u32::from_le_bytes(data.get(off..off + 4)?.try_into().ok()?))
}

fn read_u64(data: &[u8], off: usize) -> Option<u64> {
    Some(u64::from_le_bytes(data.get(off..off + 8)?.try_into().ok()?))
}

/// Parse the program headers out of a mapped ELF64 header. Returns an empty
/// list for anything that is not a little-endian ELF64 image.
#[must_use]
pub fn parse_program_headers(header: &[u8]) -> Vec<Phdr> {
    if header.len() < 0x40 || header[..4] != ELF_MAGIC {
        return Vec::new();
    }
    // EI_CLASS must be ELFCLASS64, EI_DATA little-endian.
    if header[4] != 2 || header[5] != 1 {
        return Vec::new();
    }

    let Some(phoff) = read_u64(header, 0x20) else {
        return Vec::new();
    };
    let Some(phentsize) = read_u16(header, 0x36) else {
        return Vec::new();
    };
    let Some(phnum) = read_u16(header, 0x38) else {
        return Vec::new();
    };
    if phentsize < 56 {
        return Vec::new();
    }

    let mut out = Vec::with_capacity(usize::from(phnum));
    for i in 0..usize::from(phnum) {
        let base = phoff as usize + i * usize::from(phentsize);
        let (Some(p_type), Some(p_flags)) = (read_u32(header, base), read_u32(header, base + 4))
        else {
            break;
        };
        let (Some(p_offset), Some(p_vaddr)) =
            (read_u64(header, base + 0x08), read_u64(header, base + 0x10))
        else {
            break;
        };
        let (Some(p_filesz), Some(p_memsz)) =
            (read_u64(header, base + 0x20), read_u64(header, base + 0x28))
        else {
            break;
        };
        out.push(Phdr {
            p_type,
            p_flags,
            p_offset,
            p_vaddr,
            p_filesz,
            p_memsz,
        });
    }
    out
}

/// Infer the candidate base virtual addresses for a file mapping described
/// by `(addr, size, file_offset, access_flags)` against an image's program
/// headers. Usually one candidate; edge cases can produce several.
#[must_use]
pub fn infer_mapping_base(
    phdrs: &[Phdr],
    addr: u64,
    _size: u64,
    file_offset: u64,
    access_flags: u32,
) -> Vec<u64> {
    let Some(first_load) = phdrs.iter().find(|p| p.p_type == PT_LOAD) else {
        return Vec::new();
    };
    let page_mask = !(PAGE_SIZE - 1);

    let mut out = Vec::new();
    for phdr in phdrs {
        if phdr.p_type != PT_LOAD {
            continue;
        }
        if phdr.p_flags & (PF_X | PF_W | PF_R) != access_flags & (PF_X | PF_W | PF_R) {
            continue;
        }
        // The mapping's file offset must fall inside this segment.
        let segment_start_offset = phdr.p_offset.wrapping_sub(phdr.p_vaddr & 0xfff);
        if file_offset >= segment_start_offset
            && file_offset < segment_start_offset + phdr.p_filesz
            && (file_offset & page_mask) == (phdr.p_offset & page_mask)
        {
            let image_base_vaddr = first_load.p_vaddr - (first_load.p_offset & 0xfff);
            let segment_vaddr = phdr.p_vaddr - (phdr.p_offset & 0xfff);
            out.push(
                addr.wrapping_sub(segment_vaddr)
                    .wrapping_add(image_base_vaddr)
                    .wrapping_sub(file_offset - segment_start_offset),
            );
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a tiny ELF64 header image with the given phdrs.
    fn elf_image(phdrs: &[Phdr]) -> Vec<u8> {
        let phoff = 0x40u64;
        let mut out = vec![0u8; 0x40 + phdrs.len() * 56];
        out[..4].copy_from_slice(&ELF_MAGIC);
        out[4] = 2; // ELFCLASS64
        out[5] = 1; // little-endian
        out[0x20..0x28].copy_from_slice(&phoff.to_le_bytes());
        out[0x36..0x38].copy_from_slice(&56u16.to_le_bytes());
        out[0x38..0x3a].copy_from_slice(&(phdrs.len() as u16).to_le_bytes());
        for (i, p) in phdrs.iter().enumerate() {
            let base = 0x40 + i * 56;
            out[base..base + 4].copy_from_slice(&p.p_type.to_le_bytes());
            out[base + 4..base + 8].copy_from_slice(&p.p_flags.to_le_bytes());
            out[base + 8..base + 16].copy_from_slice(&p.p_offset.to_le_bytes());
            out[base + 16..base + 24].copy_from_slice(&p.p_vaddr.to_le_bytes());
            out[base + 32..base + 40].copy_from_slice(&p.p_filesz.to_le_bytes());
            out[base + 40..base + 48].copy_from_slice(&p.p_memsz.to_le_bytes());
        }
        out
    }

    fn sample_phdrs() -> Vec<Phdr> {
        vec![
            Phdr {
                p_type: PT_LOAD,
                p_flags: PF_R,
                p_offset: 0,
                p_vaddr: 0,
                p_filesz: 0x1000,
                p_memsz: 0x1000,
            },
            Phdr {
                p_type: PT_LOAD,
                p_flags: PF_R | PF_X,
                p_offset: 0x1000,
                p_vaddr: 0x1000,
                p_filesz: 0x2000,
                p_memsz: 0x2000,
            },
        ]
    }

    #[test]
    fn parses_round_trip() {
        let phdrs = sample_phdrs();
        let image = elf_image(&phdrs);
        assert_eq!(parse_program_headers(&image), phdrs);
    }

    #[test]
    fn rejects_non_elf() {
        assert!(parse_program_headers(b"not an elf").is_empty());
        assert!(parse_program_headers(&[]).is_empty());
    }

    #[test]
    fn infers_base_for_an_executable_segment() {
        let phdrs = sample_phdrs();
        // The R-X segment mapped at 0x5000_1000 with file offset 0x1000:
        // the image base is 0x5000_0000.
        let bases = infer_mapping_base(&phdrs, 0x5000_1000, 0x2000, 0x1000, PF_R | PF_X);
        assert_eq!(bases, vec![0x5000_0000]);
    }

    #[test]
    fn mismatched_flags_produce_no_candidates() {
        let phdrs = sample_phdrs();
        let bases = infer_mapping_base(&phdrs, 0x5000_1000, 0x2000, 0x1000, PF_R | PF_W);
        assert!(bases.is_empty());
    }
}
