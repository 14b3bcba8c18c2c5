use glam::{Quat, Vec2, Vec3};

use super::codec::{dequantize, quantize};
use super::field::{FieldInfo, FieldType, MAX_STRING_BYTES, NetworkSchema};

fn canonical(field: &FieldInfo, word: u32) -> u32 {
    if field.bits >= 32 {
        return word;
    }
    let mask = (1u32 << field.bits) - 1;
    if field.is_signed() {
        crate::net::sign_extend(word & mask, field.bits as u32)
    } else {
        word & mask
    }
}

/// Fills a record word by word, in schema order.
///
/// Every field must be written exactly once with a value of its declared
/// type; anything else is a programming error and panics.
pub struct FieldWriter<'a> {
    schema: &'a NetworkSchema,
    record: &'a mut [u32],
    next: usize,
}

impl<'a> FieldWriter<'a> {
    pub fn new(schema: &'a NetworkSchema, record: &'a mut [u32]) -> Self {
        assert_eq!(record.len(), schema.word_count());
        Self {
            schema,
            record,
            next: 0,
        }
    }

    fn begin(&mut self, expected: FieldType) -> &'a FieldInfo {
        let schema: &'a NetworkSchema = self.schema;
        let field = schema.fields().get(self.next).unwrap_or_else(|| {
            panic!("schema {} has only {} fields", schema.id, self.next)
        });
        assert_eq!(
            field.field_type, expected,
            "field {:?} of schema {} written as {expected:?}",
            field.name, schema.id
        );
        self.next += 1;
        field
    }

    fn put_float(&mut self, field: &FieldInfo, index: usize, value: f32) {
        let word = quantize(value, field.precision);
        debug_assert_eq!(
            canonical(field, word),
            word,
            "value {value} does not fit field {:?}",
            field.name
        );
        self.record[field.offset + index] = canonical(field, word);
    }

    pub fn write_bool(&mut self, value: bool) {
        let field = self.begin(FieldType::Bool);
        self.record[field.offset] = value as u32;
    }

    pub fn write_int(&mut self, value: i32) {
        let field = self.begin(FieldType::Int);
        debug_assert_eq!(
            canonical(field, value as u32) as i32,
            value,
            "value does not fit field {:?}",
            field.name
        );
        self.record[field.offset] = canonical(field, value as u32);
    }

    pub fn write_uint(&mut self, value: u32) {
        let field = self.begin(FieldType::UInt);
        debug_assert_eq!(
            canonical(field, value),
            value,
            "value does not fit field {:?}",
            field.name
        );
        self.record[field.offset] = canonical(field, value);
    }

    pub fn write_float(&mut self, value: f32) {
        let field = self.begin(FieldType::Float);
        self.put_float(field, 0, value);
    }

    pub fn write_vec2(&mut self, value: Vec2) {
        let field = self.begin(FieldType::Vector2);
        for (i, component) in value.to_array().into_iter().enumerate() {
            self.put_float(field, i, component);
        }
    }

    pub fn write_vec3(&mut self, value: Vec3) {
        let field = self.begin(FieldType::Vector3);
        for (i, component) in value.to_array().into_iter().enumerate() {
            self.put_float(field, i, component);
        }
    }

    pub fn write_quat(&mut self, value: Quat) {
        let field = self.begin(FieldType::Quaternion);
        for (i, component) in value.to_array().into_iter().enumerate() {
            self.put_float(field, i, component);
        }
    }

    pub fn write_string(&mut self, value: &str) {
        let field = self.begin(FieldType::String);
        let bytes = value.as_bytes();
        assert!(
            bytes.len() <= MAX_STRING_BYTES,
            "string for field {:?} longer than {MAX_STRING_BYTES} bytes",
            field.name
        );

        let words = &mut self.record[field.offset..field.offset + field.word_count()];
        words.fill(0);
        words[0] = bytes.len() as u32;
        for (i, &byte) in bytes.iter().enumerate() {
            words[1 + i / 4] |= (byte as u32) << ((i % 4) * 8);
        }
    }

    /// Asserts that every field of the schema was written.
    pub fn finish(self) {
        assert_eq!(
            self.next,
            self.schema.fields().len(),
            "schema {} left fields unwritten",
            self.schema.id
        );
    }
}

/// Reads typed values out of a record, in schema order.
pub struct FieldReader<'a> {
    schema: &'a NetworkSchema,
    record: &'a [u32],
    next: usize,
}

impl<'a> FieldReader<'a> {
    pub fn new(schema: &'a NetworkSchema, record: &'a [u32]) -> Self {
        assert_eq!(record.len(), schema.word_count());
        Self {
            schema,
            record,
            next: 0,
        }
    }

    fn begin(&mut self, expected: FieldType) -> &'a FieldInfo {
        let schema: &'a NetworkSchema = self.schema;
        let field = schema.fields().get(self.next).unwrap_or_else(|| {
            panic!("schema {} has only {} fields", schema.id, self.next)
        });
        assert_eq!(
            field.field_type, expected,
            "field {:?} of schema {} read as {expected:?}",
            field.name, schema.id
        );
        self.next += 1;
        field
    }

    fn float(&self, field: &FieldInfo, index: usize) -> f32 {
        dequantize(self.record[field.offset + index], field.precision)
    }

    pub fn read_bool(&mut self) -> bool {
        let field = self.begin(FieldType::Bool);
        self.record[field.offset] != 0
    }

    pub fn read_int(&mut self) -> i32 {
        let field = self.begin(FieldType::Int);
        self.record[field.offset] as i32
    }

    pub fn read_uint(&mut self) -> u32 {
        let field = self.begin(FieldType::UInt);
        self.record[field.offset]
    }

    pub fn read_float(&mut self) -> f32 {
        let field = self.begin(FieldType::Float);
        self.float(field, 0)
    }

    pub fn read_vec2(&mut self) -> Vec2 {
        let field = self.begin(FieldType::Vector2);
        Vec2::new(self.float(field, 0), self.float(field, 1))
    }

    pub fn read_vec3(&mut self) -> Vec3 {
        let field = self.begin(FieldType::Vector3);
        Vec3::new(self.float(field, 0), self.float(field, 1), self.float(field, 2))
    }

    pub fn read_quat(&mut self) -> Quat {
        let field = self.begin(FieldType::Quaternion);
        Quat::from_xyzw(
            self.float(field, 0),
            self.float(field, 1),
            self.float(field, 2),
            self.float(field, 3),
        )
    }

    pub fn read_string(&mut self) -> String {
        let field = self.begin(FieldType::String);
        let words = &self.record[field.offset..field.offset + field.word_count()];
        let len = (words[0] as usize).min(MAX_STRING_BYTES);
        let bytes: Vec<u8> = (0..len)
            .map(|i| (words[1 + i / 4] >> ((i % 4) * 8)) as u8)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> NetworkSchema {
        NetworkSchema::new(9)
            .with_field("level", FieldType::String, 0, 0)
            .with_field("team", FieldType::Int, 4, 0)
            .with_field("flags", FieldType::UInt, 3, 0)
    }

    #[test]
    fn test_typed_values_roundtrip() {
        let schema = schema();
        let mut record = vec![0u32; schema.word_count()];
        let mut writer = FieldWriter::new(&schema, &mut record);
        writer.write_string("arena_02");
        writer.write_int(-3);
        writer.write_uint(5);
        writer.finish();

        let mut reader = FieldReader::new(&schema, &record);
        assert_eq!(reader.read_string(), "arena_02");
        assert_eq!(reader.read_int(), -3);
        assert_eq!(reader.read_uint(), 5);
    }

    #[test]
    #[should_panic(expected = "written as Float")]
    fn test_wrong_type_panics() {
        let schema = schema();
        let mut record = vec![0u32; schema.word_count()];
        let mut writer = FieldWriter::new(&schema, &mut record);
        writer.write_float(1.0);
    }

    #[test]
    #[should_panic(expected = "left fields unwritten")]
    fn test_skipping_a_field_panics() {
        let schema = schema();
        let mut record = vec![0u32; schema.word_count()];
        let mut writer = FieldWriter::new(&schema, &mut record);
        writer.write_string("arena_02");
        writer.finish();
    }

    #[test]
    #[should_panic]
    fn test_oversized_string_panics() {
        let schema = schema();
        let mut record = vec![0u32; schema.word_count()];
        let mut writer = FieldWriter::new(&schema, &mut record);
        writer.write_string(&"x".repeat(MAX_STRING_BYTES + 1));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "does not fit field \"speed\"")]
    fn test_float_out_of_quantized_range_panics() {
        let schema = NetworkSchema::new(4).with_field("speed", FieldType::Float, 8, 2);
        let mut record = vec![0u32; schema.word_count()];
        let mut writer = FieldWriter::new(&schema, &mut record);
        writer.write_float(5.0);
    }

    #[test]
    fn test_float_inside_quantized_range_keeps_precision() {
        let schema = NetworkSchema::new(4).with_field("speed", FieldType::Float, 8, 2);
        let mut record = vec![0u32; schema.word_count()];
        let mut writer = FieldWriter::new(&schema, &mut record);
        writer.write_float(-1.27);
        writer.finish();

        let mut reader = FieldReader::new(&schema, &record);
        assert!((reader.read_float() + 1.27).abs() < 1e-4);
    }
}
