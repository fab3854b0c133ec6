use opal_decoder::{
    decode_one, decode_prefixes, scan_prefixes, DecodeError, DecodeMode, MAX_INSTRUCTION_LEN,
};
use opal_types::SegReg;

fn assert_prefix_api_matches_decode_one(mode: DecodeMode, bytes: &[u8]) {
    let decoded = decode_one(mode, 0, bytes).expect("decode_one");

    let prefixes_only = decode_prefixes(mode, bytes).expect("decode_prefixes");
    assert_eq!(prefixes_only, decoded.prefixes);

    let (prefixes, _consumed) = scan_prefixes(mode, bytes).expect("scan_prefixes");
    assert_eq!(prefixes, decoded.prefixes);
}

#[test]
fn reports_expected_consumed_prefix_lengths() {
    // no prefix
    assert_eq!(scan_prefixes(DecodeMode::Bits64, &[0x90]).unwrap().1, 0);
    // 66
    assert_eq!(
        scan_prefixes(DecodeMode::Bits64, &[0x66, 0x90]).unwrap().1,
        1
    );
    // 66 67
    assert_eq!(
        scan_prefixes(DecodeMode::Bits64, &[0x66, 0x67, 0x90])
            .unwrap()
            .1,
        2
    );
    // REX
    assert_eq!(
        scan_prefixes(DecodeMode::Bits64, &[0x48, 0x90]).unwrap().1,
        1
    );
}

#[test]
fn parses_basic_legacy_prefixes() {
    // lock add dword ptr [eax], 1
    let bytes = [0xF0, 0x83, 0x00, 0x01];
    assert_prefix_api_matches_decode_one(DecodeMode::Bits32, &bytes);

    let decoded = decode_one(DecodeMode::Bits32, 0, &bytes).expect("decode_one");
    assert!(decoded.prefixes.lock);
    assert!(!decoded.prefixes.rep);
    assert!(!decoded.prefixes.repne);

    let (_p, consumed) = scan_prefixes(DecodeMode::Bits32, &bytes).expect("scan_prefixes");
    assert_eq!(consumed, 1);
}

#[test]
fn parses_segment_and_size_prefixes() {
    // FS + operand-size override + MOV AX, [disp32] (SIB absolute form)
    let bytes = [0x64, 0x66, 0x8B, 0x04, 0x25, 0, 0, 0, 0];
    assert_prefix_api_matches_decode_one(DecodeMode::Bits64, &bytes);

    let decoded = decode_one(DecodeMode::Bits64, 0, &bytes).expect("decode_one");
    assert_eq!(decoded.prefixes.segment, Some(SegReg::Fs));
    assert!(decoded.prefixes.operand_size_override);
    assert_eq!(decoded.len as usize, bytes.len());

    let (_p, consumed) = scan_prefixes(DecodeMode::Bits64, &bytes).expect("scan_prefixes");
    assert_eq!(consumed, 2);
}

#[test]
fn parses_gs_override_prefix() {
    // GS + NOP
    let bytes = [0x65, 0x90];
    assert_prefix_api_matches_decode_one(DecodeMode::Bits64, &bytes);

    let (p, consumed) = scan_prefixes(DecodeMode::Bits64, &bytes).expect("scan_prefixes");
    assert_eq!(p.segment, Some(SegReg::Gs));
    assert_eq!(consumed, 1);
}

#[test]
fn ignores_ds_segment_override_in_64bit_mode_without_clobbering_fs() {
    // FS override + (ignored) DS override + MOV EAX, [RAX]
    let bytes = [0x64, 0x3E, 0x8B, 0x00];
    let decoded = decode_one(DecodeMode::Bits64, 0, &bytes).expect("decode");
    assert_eq!(decoded.prefixes.segment, Some(SegReg::Fs));
}

#[test]
fn ignores_ds_segment_override_in_64bit_mode() {
    // (ignored) DS override + MOV EAX, [RAX]
    let bytes = [0x3E, 0x8B, 0x00];
    let decoded = decode_one(DecodeMode::Bits64, 0, &bytes).expect("decode");
    assert_eq!(decoded.prefixes.segment, None);
}

#[test]
fn records_ds_segment_override_in_32bit_mode() {
    let bytes = [0x3E, 0x8B, 0x00];
    let decoded = decode_one(DecodeMode::Bits32, 0, &bytes).expect("decode");
    assert_eq!(decoded.prefixes.segment, Some(SegReg::Ds));
}

#[test]
fn group1_prefix_last_wins_lock_vs_rep() {
    // 01 00 => add dword ptr [rax], eax
    // LOCK; REP; <opcode> => REP wins
    let bytes = [0xF0, 0xF3, 0x01, 0x00];
    let prefixes = decode_prefixes(DecodeMode::Bits64, &bytes).expect("prefixes");
    assert!(!prefixes.lock);
    assert!(prefixes.rep);
    assert!(!prefixes.repne);

    // REP; LOCK; <opcode> => LOCK wins
    let bytes = [0xF3, 0xF0, 0x01, 0x00];
    let decoded = decode_one(DecodeMode::Bits64, 0, &bytes).expect("decode");
    assert!(decoded.prefixes.lock);
    assert!(!decoded.prefixes.rep);
    assert!(!decoded.prefixes.repne);
}

#[test]
fn parses_rex_prefix_in_64bit_mode() {
    // 4C 8B D0  => mov r10, rax (REX.WRXB = 0100_1100)
    let bytes = [0x4C, 0x8B, 0xD0];
    assert_prefix_api_matches_decode_one(DecodeMode::Bits64, &bytes);

    let decoded = decode_one(DecodeMode::Bits64, 0, &bytes).expect("decode_one");
    let rex = decoded.prefixes.rex.expect("rex");
    assert!(rex.w());
    assert!(rex.r());
    assert!(!rex.x());
    assert!(!rex.b());

    let (_p, consumed) = scan_prefixes(DecodeMode::Bits64, &bytes).expect("scan_prefixes");
    assert_eq!(consumed, 1);
}

#[test]
fn legacy_prefix_after_rex_invalidates_the_rex() {
    // REX.W; 66; add ax, ax — the REX is dead because it does not
    // immediately precede the opcode.
    let bytes = [0x48, 0x66, 0x01, 0xC0];
    let decoded = decode_one(DecodeMode::Bits64, 0, &bytes).expect("decode");
    assert!(decoded.prefixes.rex.is_none());
    assert!(decoded.prefixes.operand_size_override);
    assert_eq!(decoded.op_width, opal_types::Width::W16);
}

#[test]
fn parses_vex2_prefix() {
    // C5 F8 77 => vzeroupper
    let bytes = [0xC5, 0xF8, 0x77];
    assert_prefix_api_matches_decode_one(DecodeMode::Bits64, &bytes);

    let decoded = decode_one(DecodeMode::Bits64, 0, &bytes).expect("decode_one");
    assert!(decoded.prefixes.vex.is_some());

    let (_p, consumed) = scan_prefixes(DecodeMode::Bits64, &bytes).expect("scan_prefixes");
    assert_eq!(consumed, 2);
}

#[test]
fn parses_evex_prefix_bytes() {
    // 62 F1 7C 48 58 C0 => vaddps zmm0, zmm0, zmm0. We account for the
    // prefix but report the instruction undefined (no AVX-512 lowering).
    let bytes = [0x62, 0xF1, 0x7C, 0x48, 0x58, 0xC0];
    let (p, consumed) = scan_prefixes(DecodeMode::Bits32, &bytes).expect("scan_prefixes");
    assert!(p.evex.is_some());
    assert_eq!(consumed, 4);
    assert_eq!(
        decode_one(DecodeMode::Bits32, 0, &bytes).unwrap_err(),
        DecodeError::Undefined
    );
}

#[test]
fn does_not_misdetect_bound_as_evex_in_32bit_mode() {
    // 62 00 => bound eax, [eax]: 0x62 is not EVEX here.
    let bytes = [0x62, 0x00];
    let (p, consumed) = scan_prefixes(DecodeMode::Bits32, &bytes).expect("scan_prefixes");
    assert!(p.evex.is_none());
    assert_eq!(consumed, 0);
}

#[test]
fn does_not_misdetect_lds_as_vex_in_32bit_mode() {
    // C5 00 => lds eax, [eax] (valid in 32-bit mode; 0xC5 is not VEX here)
    let bytes = [0xC5, 0x00];
    let (p, consumed) = scan_prefixes(DecodeMode::Bits32, &bytes).expect("scan_prefixes");
    assert!(p.vex.is_none());
    assert_eq!(consumed, 0);
}

#[test]
fn does_not_misdetect_les_as_vex_in_32bit_mode() {
    // C4 00 => les eax, [eax]
    let bytes = [0xC4, 0x00];
    let (p, consumed) = scan_prefixes(DecodeMode::Bits32, &bytes).expect("scan_prefixes");
    assert!(p.vex.is_none());
    assert_eq!(consumed, 0);
}

#[test]
fn detects_vex_in_32bit_mode_when_modrm_bits_say_so() {
    // C5 F8 77 is VEX even in 32-bit mode because the second byte has its
    // top two bits set (mod == 11, which LDS cannot encode).
    let bytes = [0xC5, 0xF8, 0x77];
    let (p, consumed) = scan_prefixes(DecodeMode::Bits32, &bytes).expect("scan_prefixes");
    assert!(p.vex.is_some());
    assert_eq!(consumed, 2);
}

#[test]
fn reports_truncated_multibyte_prefixes() {
    assert_eq!(
        scan_prefixes(DecodeMode::Bits64, &[0xC5]).unwrap_err(),
        DecodeError::Truncated
    );
    assert_eq!(
        scan_prefixes(DecodeMode::Bits64, &[0xC4, 0xE2]).unwrap_err(),
        DecodeError::Truncated
    );
    assert_eq!(
        scan_prefixes(DecodeMode::Bits64, &[0x62, 0xF1, 0x7C]).unwrap_err(),
        DecodeError::Truncated
    );
}

#[test]
fn rejects_empty_input() {
    assert_eq!(
        decode_one(DecodeMode::Bits64, 0, &[]).unwrap_err(),
        DecodeError::EmptyInput
    );
    assert_eq!(
        decode_prefixes(DecodeMode::Bits64, &[]).unwrap_err(),
        DecodeError::EmptyInput
    );
    assert_eq!(
        scan_prefixes(DecodeMode::Bits64, &[]).unwrap_err(),
        DecodeError::EmptyInput
    );
}

#[test]
fn never_returns_length_over_15() {
    let bytes = [0x90u8; MAX_INSTRUCTION_LEN];
    let decoded = decode_one(DecodeMode::Bits64, 0, &bytes).expect("decode");
    assert!(decoded.len as usize <= MAX_INSTRUCTION_LEN);

    // Prefix scanning honors the same architectural cap: an all-prefix
    // stream runs off the end of the longest legal instruction.
    let bytes = [0x66u8; MAX_INSTRUCTION_LEN + 4];
    assert_eq!(
        scan_prefixes(DecodeMode::Bits64, &bytes).unwrap_err(),
        DecodeError::Truncated
    );
}
