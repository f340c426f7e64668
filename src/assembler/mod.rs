//! Two-pass symbolic assembler: label resolution followed by byte
//! emission, producing a little-endian image plus a source-line map.

use std::collections::HashMap;

use crate::error::AssembleError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Operand {
    Reg(u8),
    Imm(u16),
}

struct OpcodeSpec {
    opcode: u8,
    operands: usize,
    has_immediate: bool,
}

fn opcode_table() -> HashMap<&'static str, OpcodeSpec> {
    let specs: &[(&str, u8, usize, bool)] = &[
        ("HLT", 0x00, 0, false),
        ("NOP", 0x01, 0, false),
        ("LDI", 0x02, 1, true),
        ("MOV", 0x03, 2, false),
        ("LD", 0x04, 2, false),
        ("ST", 0x05, 2, false),
        ("ADD", 0x06, 2, false),
        ("SUB", 0x07, 2, false),
        ("AND", 0x08, 2, false),
        ("OR", 0x09, 2, false),
        ("XOR", 0x0A, 2, false),
        ("NOT", 0x0B, 1, false),
        ("SHL", 0x0C, 2, false),
        ("SHR", 0x0D, 2, false),
        ("JMP", 0x0E, 0, true),
        ("JZ", 0x0F, 0, true),
        ("JNZ", 0x10, 0, true),
        ("JN", 0x11, 0, true),
        ("PUSH", 0x12, 1, false),
        ("POP", 0x13, 1, false),
        ("CALL", 0x14, 0, true),
        ("RET", 0x15, 0, false),
        ("EI", 0x16, 0, false),
        ("DI", 0x17, 0, false),
        ("RETI", 0x18, 0, false),
        ("WFI", 0x19, 0, false),
        ("LDSP", 0x1A, 1, false),
        ("STSP", 0x1B, 1, false),
        ("MUL", 0x1C, 2, false),
        ("DIV", 0x1D, 2, false),
        ("FILL", 0x1E, 3, false),
        ("COPY", 0x1F, 3, false),
        ("LDB", 0x20, 2, false),
        ("STB", 0x21, 2, false),
        ("IDIV", 0x22, 2, false),
        ("JC", 0x23, 0, true),
        ("JNC", 0x24, 0, true),
    ];
    specs
        .iter()
        .map(|&(name, opcode, operands, has_immediate)| {
            (
                name,
                OpcodeSpec {
                    opcode,
                    operands,
                    has_immediate,
                },
            )
        })
        .collect()
}

pub struct AssembledProgram {
    pub code: Vec<u8>,
    /// Maps a byte address to the 1-based source line that produced the
    /// first byte at that address.
    pub source_map: HashMap<u16, usize>,
}

struct Line {
    number: usize,
    label: Option<String>,
    directive_or_mnemonic: Option<String>,
    operands: Vec<String>,
}

fn parse_line(number: usize, raw: &str) -> Line {
    let mut text = raw;
    if let Some(idx) = text.find(';') {
        text = &text[..idx];
    }
    let text = text.trim();

    let mut label = None;
    let mut rest = text;
    if let Some(colon) = text.find(':') {
        let (maybe_label, after) = text.split_at(colon);
        if !maybe_label.trim().is_empty() && !maybe_label.contains(char::is_whitespace) {
            label = Some(maybe_label.trim().to_string());
            rest = after[1..].trim();
        }
    }

    if rest.is_empty() {
        return Line {
            number,
            label,
            directive_or_mnemonic: None,
            operands: Vec::new(),
        };
    }

    let (mnemonic, operand_text) = match rest.split_once(char::is_whitespace) {
        Some((m, o)) => (m, o.trim()),
        None => (rest, ""),
    };

    let operands = split_operands(operand_text);

    Line {
        number,
        label,
        directive_or_mnemonic: Some(mnemonic.to_string()),
        operands,
    }
}

fn split_operands(text: &str) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    if text.starts_with('"') {
        return vec![text.to_string()];
    }
    text.split(',').map(|s| s.trim().to_string()).collect()
}

fn reg_number(token: &str) -> Option<u8> {
    let upper = token.to_ascii_uppercase();
    if let Some(stripped) = upper.strip_prefix('R') {
        stripped.parse::<u8>().ok().filter(|&n| n < 8)
    } else {
        None
    }
}

fn parse_string_literal(text: &str) -> String {
    let inner = text.trim().trim_matches('"');
    let mut out = String::new();
    let mut chars = inner.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('r') => out.push('\r'),
                Some('0') => out.push('\0'),
                Some('\\') => out.push('\\'),
                Some('"') => out.push('"'),
                Some(other) => out.push(other),
                None => {}
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn resolve_immediate(
    token: &str,
    labels: &HashMap<String, u16>,
    line: usize,
) -> Result<u16, AssembleError> {
    let t = token.trim();
    if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        let v = i64::from_str_radix(hex, 16).map_err(|_| AssembleError::ImmediateOutOfRange { line, value: 0 })?;
        if !(0..=0xFFFF).contains(&v) {
            return Err(AssembleError::ImmediateOutOfRange { line, value: v });
        }
        return Ok(v as u16);
    }
    if let Ok(v) = t.parse::<i64>() {
        if !(-32768..=65535).contains(&v) {
            return Err(AssembleError::ImmediateOutOfRange { line, value: v });
        }
        return Ok(v as u16);
    }
    labels
        .get(&t.to_ascii_lowercase())
        .copied()
        .ok_or_else(|| AssembleError::UndefinedLabel {
            line,
            label: t.to_string(),
        })
}

/// Runs both assembler passes over `source` and returns the byte image
/// plus its source-line map.
pub fn assemble(source: &str) -> Result<AssembledProgram, AssembleError> {
    let opcodes = opcode_table();
    let lines: Vec<Line> = source
        .lines()
        .enumerate()
        .map(|(i, raw)| parse_line(i + 1, raw))
        .collect();

    // Pass 1: compute addresses and register labels.
    let mut labels: HashMap<String, u16> = HashMap::new();
    let mut cursor: u32 = 0;
    let mut sizes: Vec<u16> = Vec::with_capacity(lines.len());

    for line in &lines {
        if let Some(label) = &line.label {
            let key = label.to_ascii_lowercase();
            if labels.contains_key(&key) {
                return Err(AssembleError::DuplicateLabel {
                    line: line.number,
                    label: label.clone(),
                });
            }
            labels.insert(key, cursor as u16);
        }

        let size: u32 = match &line.directive_or_mnemonic {
            None => 0,
            Some(m) => {
                let upper = m.to_ascii_uppercase();
                match upper.as_str() {
                    ".ORG" => {
                        let target = resolve_immediate(&line.operands[0], &labels, line.number)?;
                        if (target as u32) < cursor {
                            return Err(AssembleError::ImmediateOutOfRange {
                                line: line.number,
                                value: target as i64,
                            });
                        }
                        cursor = target as u32;
                        0
                    }
                    ".WORD" => 2,
                    ".STRING" => {
                        let s = parse_string_literal(&line.operands[0]);
                        (s.len() + 1) as u32
                    }
                    ".PSTRING" => {
                        let s = parse_string_literal(&line.operands[0]);
                        let packed_words = (s.len() + 1) / 2;
                        (packed_words * 2 + 2) as u32
                    }
                    _ => {
                        let spec = opcodes.get(upper.as_str()).ok_or_else(|| {
                            AssembleError::UnknownMnemonic {
                                line: line.number,
                                text: m.clone(),
                            }
                        })?;
                        if line.operands.len() != spec.operands
                            && !(spec.operands == 0 && line.operands.is_empty())
                        {
                            return Err(AssembleError::WrongOperandCount {
                                line: line.number,
                                mnemonic: upper.clone(),
                                expected: spec.operands,
                                found: line.operands.len(),
                            });
                        }
                        if spec.has_immediate {
                            4
                        } else {
                            2
                        }
                    }
                }
            }
        };
        sizes.push(size as u16);
        cursor += size;
    }

    if cursor > 0x10000 {
        return Err(AssembleError::ProgramTooLarge(cursor as usize));
    }

    // Pass 2: emit bytes.
    let mut code: Vec<u8> = Vec::with_capacity(cursor as usize);
    let mut source_map = HashMap::new();
    let mut addr: u32 = 0;

    for (line, _size) in lines.iter().zip(sizes.iter()) {
        let Some(mnemonic) = &line.directive_or_mnemonic else {
            continue;
        };
        let upper = mnemonic.to_ascii_uppercase();
        let start_addr = addr as u16;

        match upper.as_str() {
            ".ORG" => {
                let target = resolve_immediate(&line.operands[0], &labels, line.number)? as u32;
                while addr < target {
                    code.push(0);
                    addr += 1;
                }
            }
            ".WORD" => {
                let value = resolve_immediate(&line.operands[0], &labels, line.number)?;
                source_map.insert(start_addr, line.number);
                code.push((value & 0xFF) as u8);
                code.push((value >> 8) as u8);
                addr += 2;
            }
            ".STRING" => {
                source_map.insert(start_addr, line.number);
                let s = parse_string_literal(&line.operands[0]);
                for b in s.bytes() {
                    code.push(b);
                    addr += 1;
                }
                code.push(0);
                addr += 1;
            }
            ".PSTRING" => {
                source_map.insert(start_addr, line.number);
                let s = parse_string_literal(&line.operands[0]);
                let bytes: Vec<u8> = s.bytes().collect();
                for pair in bytes.chunks(2) {
                    let lo = pair[0];
                    let hi = *pair.get(1).unwrap_or(&0);
                    code.push(lo);
                    code.push(hi);
                    addr += 2;
                }
                code.push(0);
                code.push(0);
                addr += 2;
            }
            _ => {
                let spec = &opcodes[upper.as_str()];
                source_map.insert(start_addr, line.number);
                let (reg_a, reg_b, reg_c, imm) =
                    decode_operands(spec, &line.operands, &labels, line.number)?;
                let instr: u16 = ((spec.opcode as u16) << 10)
                    | ((reg_a as u16) << 7)
                    | ((reg_b as u16) << 4)
                    | ((reg_c as u16) << 1);
                code.push((instr & 0xFF) as u8);
                code.push((instr >> 8) as u8);
                addr += 2;
                if let Some(imm) = imm {
                    code.push((imm & 0xFF) as u8);
                    code.push((imm >> 8) as u8);
                    addr += 2;
                }
            }
        }
    }

    Ok(AssembledProgram {
        code,
        source_map,
    })
}

fn decode_operands(
    spec: &OpcodeSpec,
    operands: &[String],
    labels: &HashMap<String, u16>,
    line: usize,
) -> Result<(u8, u8, u8, Option<u16>), AssembleError> {
    if spec.has_immediate && spec.operands == 0 {
        // Jump/call style: single immediate address, no registers.
        let imm = resolve_immediate(&operands[0], labels, line)?;
        return Ok((0, 0, 0, Some(imm)));
    }
    if spec.has_immediate && spec.operands == 1 {
        // LDI reg, imm16
        let reg = reg_number(&operands[0]).ok_or_else(|| AssembleError::UnknownMnemonic {
            line,
            text: operands[0].clone(),
        })?;
        let imm = resolve_immediate(&operands[1], labels, line)?;
        return Ok((reg, 0, 0, Some(imm)));
    }
    let mut regs = [0u8; 3];
    for (i, token) in operands.iter().enumerate().take(3) {
        regs[i] = reg_number(token).ok_or_else(|| AssembleError::UnknownMnemonic {
            line,
            text: token.clone(),
        })?;
    }
    Ok((regs[0], regs[1], regs[2], None))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_program_assembles() {
        let asm = "LDI R0, 5\nLDI R1, 3\nADD R0, R1\nHLT\n";
        let out = assemble(asm).unwrap();
        assert_eq!(out.code.len(), 4 + 4 + 2 + 2);
    }

    #[test]
    fn labels_resolve_forward_and_backward() {
        let asm = "START:\nJMP NEXT\nHLT\nNEXT:\nNOP\nJMP START\n";
        let out = assemble(asm).unwrap();
        assert!(out.code.len() > 0);
    }

    #[test]
    fn duplicate_label_is_an_error() {
        let asm = "A:\nNOP\nA:\nNOP\n";
        let err = assemble(asm).unwrap_err();
        assert!(matches!(err, AssembleError::DuplicateLabel { .. }));
    }

    #[test]
    fn undefined_label_is_an_error() {
        let asm = "JMP NOWHERE\n";
        let err = assemble(asm).unwrap_err();
        assert!(matches!(err, AssembleError::UndefinedLabel { .. }));
    }

    #[test]
    fn string_directive_emits_null_terminated_bytes() {
        let asm = "DATA:\n.STRING \"hi\"\n";
        let out = assemble(asm).unwrap();
        assert_eq!(out.code, vec![b'h', b'i', 0]);
    }

    #[test]
    fn org_advances_cursor_and_pads_with_zeros() {
        let asm = ".ORG 0x10\nNOP\n";
        let out = assemble(asm).unwrap();
        assert_eq!(out.code.len(), 0x12);
        assert_eq!(out.code[0x10..0x12], [0x00, 0x04]);
    }

    #[test]
    fn source_map_points_at_first_byte_of_each_line() {
        let asm = "NOP\nNOP\n";
        let out = assemble(asm).unwrap();
        assert_eq!(out.source_map.get(&0), Some(&1));
        assert_eq!(out.source_map.get(&2), Some(&2));
    }
}
