//! A narrow, purpose-built x86-64 decoder.
//!
//! This is not a general disassembler — it recognises exactly the
//! instruction shapes [`crate::jit::assembler::x86_64::X86Encoder`]
//! emits, nothing more. Its only job is the S6 scenario from
//! `SPEC_FULL.md` section 8: re-decode a trace's own emitted bytes and
//! confirm the operand encoding round-trips.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rex {
    pub w: bool,
    pub r: bool,
    pub x: bool,
    pub b: bool,
}

impl Rex {
    fn from_byte(byte: u8) -> Rex {
        Rex {
            w: byte & 0b1000 != 0,
            r: byte & 0b0100 != 0,
            x: byte & 0b0010 != 0,
            b: byte & 0b0001 != 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModRm {
    pub md: u8,
    pub reg: u8,
    pub rm: u8,
    pub has_sib: bool,
    pub disp_len: usize,
}

fn decode_modrm(bytes: &[u8]) -> Option<(ModRm, usize)> {
    let byte = *bytes.first()?;
    let md = byte >> 6;
    let reg = (byte >> 3) & 0b111;
    let rm = byte & 0b111;
    let has_sib = md != 0b11 && rm == 0b100;
    let mut consumed = 1 + has_sib as usize;
    let disp_len = match md {
        0b00 => 0,
        0b01 => 1,
        0b10 => 4,
        _ => 0,
    };
    consumed += disp_len;
    if bytes.len() < consumed {
        return None;
    }
    Some((
        ModRm {
            md,
            reg,
            rm,
            has_sib,
            disp_len,
        },
        consumed,
    ))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInstr {
    pub mnemonic: &'static str,
    pub len: usize,
    pub rex: Option<Rex>,
    pub modrm: Option<ModRm>,
}

/// Decode exactly one instruction starting at `bytes[0]`. Returns the
/// mnemonic and total encoded length, or `None` if the prefix doesn't
/// match a shape this decoder understands.
pub fn decode_one(bytes: &[u8]) -> Option<DecodedInstr> {
    let mut pos = 0usize;

    let mandatory_prefix = match bytes.first() {
        Some(0xf2) => Some(0xf2),
        Some(0x66) => Some(0x66),
        _ => None,
    };
    if mandatory_prefix.is_some() {
        pos += 1;
    }

    let rex = if let Some(&byte) = bytes.get(pos) {
        if (0x40..=0x4f).contains(&byte) {
            pos += 1;
            Some(Rex::from_byte(byte))
        } else {
            None
        }
    } else {
        None
    };

    let opcode = *bytes.get(pos)?;
    pos += 1;

    match mandatory_prefix {
        Some(0xf2) => {
            if opcode != 0x0f {
                return None;
            }
            let opcode2 = *bytes.get(pos)?;
            pos += 1;
            let (modrm, consumed) = decode_modrm(&bytes[pos..])?;
            pos += consumed;
            let mnemonic = match (opcode2, modrm.md) {
                (0x10, 0b11) => "movsd_reg_reg",
                (0x10, _) => "movsd_reg_mem",
                (0x11, _) => "movsd_mem_reg",
                (0x58, _) => "addsd",
                (0x5c, _) => "subsd",
                (0x59, _) => "mulsd",
                (0x5e, _) => "divsd",
                _ => return None,
            };
            return Some(DecodedInstr {
                mnemonic,
                len: pos,
                rex,
                modrm: Some(modrm),
            });
        }
        Some(0x66) => {
            if opcode != 0x0f {
                return None;
            }
            let opcode2 = *bytes.get(pos)?;
            pos += 1;
            let (modrm, consumed) = decode_modrm(&bytes[pos..])?;
            pos += consumed;
            let mnemonic = match opcode2 {
                0x2e => "ucomisd",
                0x6e => "movq_xmm_gpr",
                _ => return None,
            };
            return Some(DecodedInstr {
                mnemonic,
                len: pos,
                rex,
                modrm: Some(modrm),
            });
        }
        _ => {}
    }

    match opcode {
        0x89 => {
            let (modrm, consumed) = decode_modrm(&bytes[pos..])?;
            pos += consumed;
            let mnemonic = if modrm.md == 0b11 { "mov_reg_reg" } else { "mov_mem_reg" };
            Some(DecodedInstr { mnemonic, len: pos, rex, modrm: Some(modrm) })
        }
        0x8b => {
            let (modrm, consumed) = decode_modrm(&bytes[pos..])?;
            pos += consumed;
            Some(DecodedInstr { mnemonic: "mov_reg_mem", len: pos, rex, modrm: Some(modrm) })
        }
        0xb8..=0xbf => {
            let width = if rex.map(|r| r.w).unwrap_or(false) { 8 } else { 4 };
            pos += width;
            if bytes.len() < pos {
                return None;
            }
            Some(DecodedInstr { mnemonic: "mov_reg_imm64", len: pos, rex, modrm: None })
        }
        0x50..=0x57 => Some(DecodedInstr { mnemonic: "push", len: pos, rex, modrm: None }),
        0x58..=0x5f => Some(DecodedInstr { mnemonic: "pop", len: pos, rex, modrm: None }),
        0xc3 => Some(DecodedInstr { mnemonic: "ret", len: pos, rex, modrm: None }),
        0xe9 => {
            pos += 4;
            if bytes.len() < pos {
                return None;
            }
            Some(DecodedInstr { mnemonic: "jmp_rel32", len: pos, rex, modrm: None })
        }
        0x0f => {
            let opcode2 = *bytes.get(pos)?;
            pos += 1;
            match opcode2 {
                0x80..=0x8f => {
                    pos += 4;
                    if bytes.len() < pos {
                        return None;
                    }
                    Some(DecodedInstr { mnemonic: "jcc_rel32", len: pos, rex, modrm: None })
                }
                0x90..=0x9f => {
                    let (modrm, consumed) = decode_modrm(&bytes[pos..])?;
                    pos += consumed;
                    Some(DecodedInstr { mnemonic: "setcc", len: pos, rex, modrm: Some(modrm) })
                }
                0xb6 => {
                    let (modrm, consumed) = decode_modrm(&bytes[pos..])?;
                    pos += consumed;
                    Some(DecodedInstr { mnemonic: "movzx", len: pos, rex, modrm: Some(modrm) })
                }
                _ => None,
            }
        }
        0xff => {
            let (modrm, consumed) = decode_modrm(&bytes[pos..])?;
            pos += consumed;
            if modrm.reg != 2 {
                return None;
            }
            Some(DecodedInstr { mnemonic: "call_reg", len: pos, rex, modrm: Some(modrm) })
        }
        _ => None,
    }
}

/// Decode a whole buffer, stopping at the first byte this decoder cannot
/// recognise. Used by the S6 test to walk an entire emitted trace.
pub fn decode_all(bytes: &[u8]) -> Vec<DecodedInstr> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        match decode_one(&bytes[pos..]) {
            Some(instr) => {
                pos += instr.len;
                out.push(instr);
            }
            None => break,
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::assembler::wrapper::AssemblyWrapper;
    use crate::jit::assembler::x86_64::{Gpr, Xmm, X86Encoder};

    fn bytes_of(buf: &AssemblyWrapper) -> Vec<u8> {
        // SAFETY: test-only read of a buffer we just wrote and did not lock.
        unsafe { std::slice::from_raw_parts(buf.start(), buf.size()).to_vec() }
    }

    #[test]
    fn decodes_mov_reg_reg() {
        let mut buf = AssemblyWrapper::new(256).unwrap();
        X86Encoder::mov_reg_reg(&mut buf, Gpr::RBX, Gpr::RAX).unwrap();
        let decoded = decode_one(&bytes_of(&buf)).unwrap();
        assert_eq!(decoded.mnemonic, "mov_reg_reg");
        assert_eq!(decoded.len, buf.size());
    }

    #[test]
    fn decodes_every_arithmetic_opcode_at_every_allocation() {
        let mut buf = AssemblyWrapper::new(4096).unwrap();
        let mut expected = Vec::new();
        for reg_pair in [(0u8, 1u8), (0, 8), (8, 9), (14, 15)] {
            let (dst, src) = (Xmm(reg_pair.0), Xmm(reg_pair.1));
            X86Encoder::addsd(&mut buf, dst, src).unwrap();
            expected.push("addsd");
            X86Encoder::subsd(&mut buf, dst, src).unwrap();
            expected.push("subsd");
            X86Encoder::mulsd(&mut buf, dst, src).unwrap();
            expected.push("mulsd");
            X86Encoder::divsd(&mut buf, dst, src).unwrap();
            expected.push("divsd");
        }
        let decoded = decode_all(&bytes_of(&buf));
        let mnemonics: Vec<&str> = decoded.iter().map(|d| d.mnemonic).collect();
        assert_eq!(mnemonics, expected);
    }

    #[test]
    fn decodes_jmp_and_call_reg() {
        let mut buf = AssemblyWrapper::new(256).unwrap();
        X86Encoder::jmp_rel32_placeholder(&mut buf).unwrap();
        X86Encoder::call_reg(&mut buf, Gpr::RDI).unwrap();
        X86Encoder::ret(&mut buf).unwrap();
        let decoded = decode_all(&bytes_of(&buf));
        let mnemonics: Vec<&str> = decoded.iter().map(|d| d.mnemonic).collect();
        assert_eq!(mnemonics, vec!["jmp_rel32", "call_reg", "ret"]);
    }
}
