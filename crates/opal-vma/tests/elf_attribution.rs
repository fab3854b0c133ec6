//! ELF image attribution: non-header mappings find their instance via the
//! program headers; re-mapping a header starts a new instance.

use opal_vma::elf::{Phdr, PF_R, PF_X, PT_LOAD};
use opal_vma::{Backing, ExecutableFileInfo, MapFlags, Prot, VmaTracker, PAGE_SIZE};

fn elf_image() -> Vec<u8> {
    let phdrs = [
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
    ];
    let phoff = 0x40u64;
    let mut out = vec![0u8; 0x40 + phdrs.len() * 56];
    out[..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
    out[4] = 2;
    out[5] = 1;
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

fn file_info() -> ExecutableFileInfo {
    ExecutableFileInfo {
        filename: "/usr/lib/libdemo.so".into(),
        file_id: "deadbeefcafef00d".into(),
    }
}

#[test]
fn non_header_mapping_attributes_to_the_same_resource() {
    let tracker = VmaTracker::new();
    let image = elf_image();

    // Header mapping at base 0x5000_0000.
    tracker.track_mmap(
        0x5000_0000,
        PAGE_SIZE,
        Prot::READ,
        MapFlags::empty(),
        Backing::File {
            dev: 8,
            inode: 42,
            file_info: Some(file_info()),
            header_bytes: Some(&image),
        },
        0,
    );
    assert_eq!(tracker.resource_instances(8, 42), 1);

    // Executable section of the same image.
    tracker.track_mmap(
        0x5000_1000,
        0x2000,
        Prot::READ | Prot::EXEC,
        MapFlags::empty(),
        Backing::File {
            dev: 8,
            inode: 42,
            file_info: None,
            header_bytes: None,
        },
        0x1000,
    );
    assert_eq!(tracker.resource_instances(8, 42), 1);

    let (_, header) = tracker.query(0x5000_0000).unwrap();
    let (_, text) = tracker.query(0x5000_1000).unwrap();
    let (Some(a), Some(b)) = (header.resource, text.resource) else {
        panic!("both mappings must carry a resource");
    };
    assert!(std::sync::Arc::ptr_eq(&a, &b));
}

#[test]
fn executable_section_lookup_reports_the_image_base() {
    let tracker = VmaTracker::new();
    let image = elf_image();
    tracker.track_mmap(
        0x5000_0000,
        PAGE_SIZE,
        Prot::READ,
        MapFlags::empty(),
        Backing::File {
            dev: 8,
            inode: 42,
            file_info: Some(file_info()),
            header_bytes: Some(&image),
        },
        0,
    );
    tracker.track_mmap(
        0x5000_1000,
        0x2000,
        Prot::READ | Prot::EXEC,
        MapFlags::empty(),
        Backing::File {
            dev: 8,
            inode: 42,
            file_info: None,
            header_bytes: None,
        },
        0x1000,
    );

    let section = tracker
        .executable_section_for(0x5000_1800)
        .expect("attributed section");
    assert_eq!(section.image_base, 0x5000_0000);
    assert_eq!(section.start, 0x5000_1000);
    assert_eq!(section.end, 0x5000_3000);
    assert_eq!(section.file.file_id, "deadbeefcafef00d");

    // Anonymous memory has no section.
    tracker.track_mmap(
        0x9000_0000,
        PAGE_SIZE,
        Prot::READ | Prot::EXEC,
        MapFlags::ANONYMOUS,
        Backing::Anonymous { shared: false },
        0,
    );
    assert!(tracker.executable_section_for(0x9000_0000).is_none());
}

#[test]
fn remapping_the_header_starts_a_new_instance() {
    let tracker = VmaTracker::new();
    let image = elf_image();

    for base in [0x5000_0000u64, 0x6000_0000] {
        tracker.track_mmap(
            base,
            PAGE_SIZE,
            Prot::READ,
            MapFlags::empty(),
            Backing::File {
                dev: 8,
                inode: 42,
                file_info: Some(file_info()),
                header_bytes: Some(&image),
            },
            0,
        );
    }
    // Same file, two base addresses: two resource instances.
    assert_eq!(tracker.resource_instances(8, 42), 2);

    let (_, first) = tracker.query(0x5000_0000).unwrap();
    let (_, second) = tracker.query(0x6000_0000).unwrap();
    let (Some(a), Some(b)) = (first.resource, second.resource) else {
        panic!("both mappings must carry a resource");
    };
    assert!(!std::sync::Arc::ptr_eq(&a, &b));
}

#[test]
fn section_mapping_attributes_to_the_right_instance() {
    let tracker = VmaTracker::new();
    let image = elf_image();

    for base in [0x5000_0000u64, 0x6000_0000] {
        tracker.track_mmap(
            base,
            PAGE_SIZE,
            Prot::READ,
            MapFlags::empty(),
            Backing::File {
                dev: 8,
                inode: 42,
                file_info: Some(file_info()),
                header_bytes: Some(&image),
            },
            0,
        );
    }

    // Section of the *second* instance.
    tracker.track_mmap(
        0x6000_1000,
        0x2000,
        Prot::READ | Prot::EXEC,
        MapFlags::empty(),
        Backing::File {
            dev: 8,
            inode: 42,
            file_info: None,
            header_bytes: None,
        },
        0x1000,
    );

    let (_, second_header) = tracker.query(0x6000_0000).unwrap();
    let (_, text) = tracker.query(0x6000_1000).unwrap();
    let (Some(a), Some(b)) = (second_header.resource, text.resource) else {
        panic!("expected resources");
    };
    assert!(std::sync::Arc::ptr_eq(&a, &b));
}
