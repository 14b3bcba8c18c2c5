use crate::net::{BitReader, BitWriter, ProtocolError, sign_extend};

use super::field::{FieldInfo, FieldType, MAX_STRING_BYTES, NetworkSchema};

pub const ENCODER_PRECISION_SCALES: [f32; 4] = [1.0, 10.0, 100.0, 1000.0];
pub const DECODER_PRECISION_SCALES: [f32; 4] = [1.0, 0.1, 0.01, 0.001];

const STRING_LENGTH_BITS: u32 = 7;

fn field_words<'a>(field: &FieldInfo, record: &'a [u32]) -> &'a [u32] {
    &record[field.offset..field.offset + field.word_count()]
}

fn write_full_word(writer: &mut BitWriter, field: &FieldInfo, word: u32) {
    writer.write_bits(word, field.bits as u32);
}

fn read_full_word(reader: &mut BitReader<'_>, field: &FieldInfo) -> Result<u32, ProtocolError> {
    let raw = reader.read_bits(field.bits as u32)?;
    Ok(if field.is_signed() {
        sign_extend(raw, field.bits as u32)
    } else {
        raw
    })
}

fn write_string(writer: &mut BitWriter, words: &[u32]) {
    let len = (words[0] as usize).min(MAX_STRING_BYTES);
    writer.write_bits(len as u32, STRING_LENGTH_BITS);
    for i in 0..len {
        let word = words[1 + i / 4];
        writer.write_bits(word >> ((i % 4) * 8), 8);
    }
}

fn read_string(reader: &mut BitReader<'_>, words: &mut [u32]) -> Result<(), ProtocolError> {
    let len = reader.read_bits(STRING_LENGTH_BITS)? as usize;
    if len > MAX_STRING_BYTES {
        return Err(ProtocolError::InvalidSchema(format!(
            "string of {len} bytes exceeds {MAX_STRING_BYTES}"
        )));
    }
    words.fill(0);
    words[0] = len as u32;
    for i in 0..len {
        let byte = reader.read_bits(8)?;
        words[1 + i / 4] |= byte << ((i % 4) * 8);
    }
    Ok(())
}

/// Encodes `record` laid out per `schema`.
///
/// Without a baseline every field is written at its declared width. With a
/// baseline each field gets a changed bit and only changed fields follow, as
/// zigzag packed word deltas (strings and bools are resent whole).
pub fn copy_fields_from_buffer(
    writer: &mut BitWriter,
    schema: &NetworkSchema,
    record: &[u32],
    baseline: Option<&[u32]>,
) {
    assert_eq!(
        record.len(),
        schema.word_count(),
        "record does not match schema {}",
        schema.id
    );

    for field in schema.fields() {
        let words = field_words(field, record);
        match baseline {
            None => match field.field_type {
                FieldType::String => write_string(writer, words),
                _ => {
                    for &word in words {
                        write_full_word(writer, field, word);
                    }
                }
            },
            Some(baseline) => {
                let base = field_words(field, baseline);
                let changed = words != base;
                writer.write_bool(changed);
                if !changed {
                    continue;
                }
                match field.field_type {
                    FieldType::String => write_string(writer, words),
                    FieldType::Bool => writer.write_bits(words[0], 1),
                    _ => {
                        for (&word, &base) in words.iter().zip(base) {
                            writer.write_packed_i32(word.wrapping_sub(base) as i32);
                        }
                    }
                }
            }
        }
    }
}

/// Decodes what [`copy_fields_from_buffer`] wrote into `record`.
///
/// Fields unchanged relative to the baseline are copied from it.
pub fn copy_fields_to_buffer(
    reader: &mut BitReader<'_>,
    schema: &NetworkSchema,
    record: &mut [u32],
    baseline: Option<&[u32]>,
) -> Result<(), ProtocolError> {
    assert_eq!(
        record.len(),
        schema.word_count(),
        "record does not match schema {}",
        schema.id
    );

    for field in schema.fields() {
        let range = field.offset..field.offset + field.word_count();
        match baseline {
            None => match field.field_type {
                FieldType::String => read_string(reader, &mut record[range])?,
                _ => {
                    for word in &mut record[range] {
                        *word = read_full_word(reader, field)?;
                    }
                }
            },
            Some(baseline) => {
                let base = &baseline[range.clone()];
                if !reader.read_bool()? {
                    record[range].copy_from_slice(base);
                    continue;
                }
                match field.field_type {
                    FieldType::String => read_string(reader, &mut record[range])?,
                    FieldType::Bool => record[field.offset] = reader.read_bits(1)?,
                    _ => {
                        for (word, &base) in record[range].iter_mut().zip(base) {
                            *word = base.wrapping_add(reader.read_packed_i32()? as u32);
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

/// Advances past an encoded record without keeping it.
pub fn skip_fields(
    reader: &mut BitReader<'_>,
    schema: &NetworkSchema,
    delta: bool,
) -> Result<(), ProtocolError> {
    let mut scratch = [0u32; super::field::STRING_WORDS];
    for field in schema.fields() {
        if delta && !reader.read_bool()? {
            continue;
        }
        match (field.field_type, delta) {
            (FieldType::String, _) => read_string(reader, &mut scratch)?,
            (FieldType::Bool, true) => {
                reader.read_bits(1)?;
            }
            (_, true) => {
                for _ in 0..field.word_count() {
                    reader.read_packed_u32()?;
                }
            }
            (_, false) => {
                for _ in 0..field.word_count() {
                    reader.read_bits(field.bits as u32)?;
                }
            }
        }
    }
    Ok(())
}

/// Extrapolates the next record from three baselines, newest first.
///
/// Integer and quantized float words that moved by the same amount between
/// `b2 -> b1` and `b1 -> b0` continue along that line, everything else
/// repeats `b0`. Both ends run this on identical input, so the result is
/// bit-exact on either side.
pub fn predict_record(
    schema: &NetworkSchema,
    b0: &[u32],
    b1: &[u32],
    b2: &[u32],
    out: &mut [u32],
) {
    out.copy_from_slice(b0);
    for field in schema.fields().iter().filter(|f| f.is_predictable()) {
        for i in field.offset..field.offset + field.word_count() {
            let d0 = b0[i].wrapping_sub(b1[i]) as i32;
            let d1 = b1[i].wrapping_sub(b2[i]) as i32;
            if d0 == d1 {
                out[i] = b0[i].wrapping_add(d0 as u32);
            }
        }
    }
}

pub fn quantize(value: f32, precision: u8) -> u32 {
    if precision == 0 {
        value.to_bits()
    } else {
        (value * ENCODER_PRECISION_SCALES[precision as usize]).round() as i32 as u32
    }
}

pub fn dequantize(word: u32, precision: u8) -> f32 {
    if precision == 0 {
        f32::from_bits(word)
    } else {
        word as i32 as f32 * DECODER_PRECISION_SCALES[precision as usize]
    }
}
