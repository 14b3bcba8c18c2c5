use crate::net::{BitReader, BitWriter, ProtocolError};

pub const MAX_STRING_BYTES: usize = 64;
/// Words used by a string field: the byte length followed by the packed bytes.
pub const STRING_WORDS: usize = 1 + MAX_STRING_BYTES / 4;
pub const MAX_FIELDS: usize = 255;
pub const MAX_PRECISION: u8 = 3;

const MAX_FIELD_NAME: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FieldType {
    Bool = 0,
    Int = 1,
    UInt = 2,
    Float = 3,
    Vector2 = 4,
    Vector3 = 5,
    Quaternion = 6,
    String = 7,
}

impl FieldType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Bool,
            1 => Self::Int,
            2 => Self::UInt,
            3 => Self::Float,
            4 => Self::Vector2,
            5 => Self::Vector3,
            6 => Self::Quaternion,
            7 => Self::String,
            _ => return None,
        })
    }

    /// Number of record words the field occupies.
    pub fn word_count(self) -> usize {
        match self {
            Self::Bool | Self::Int | Self::UInt | Self::Float => 1,
            Self::Vector2 => 2,
            Self::Vector3 => 3,
            Self::Quaternion => 4,
            Self::String => STRING_WORDS,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(
            self,
            Self::Float | Self::Vector2 | Self::Vector3 | Self::Quaternion
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    pub name: String,
    pub field_type: FieldType,
    /// Wire width of each word when sent without a baseline.
    pub bits: u8,
    /// Decimal digits kept for float components, 0 sends raw floats.
    pub precision: u8,
    /// First record word of the field.
    pub offset: usize,
}

impl FieldInfo {
    pub fn word_count(&self) -> usize {
        self.field_type.word_count()
    }

    /// Float components stored as scaled integers.
    pub fn is_quantized(&self) -> bool {
        self.field_type.is_float() && self.precision > 0
    }

    /// Words that can be predicted by linear extrapolation.
    pub fn is_predictable(&self) -> bool {
        matches!(self.field_type, FieldType::Int | FieldType::UInt) || self.is_quantized()
    }

    /// Whether record words hold signed values narrower than 32 bits.
    pub fn is_signed(&self) -> bool {
        self.field_type == FieldType::Int || self.is_quantized()
    }
}

/// Ordered field layout of one kind of record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSchema {
    pub id: u16,
    fields: Vec<FieldInfo>,
    word_count: usize,
}

impl NetworkSchema {
    pub fn new(id: u16) -> Self {
        Self {
            id,
            fields: Vec::new(),
            word_count: 0,
        }
    }

    /// Appends a field. `bits` is ignored for bools, strings and raw floats.
    pub fn with_field(mut self, name: &str, field_type: FieldType, bits: u8, precision: u8) -> Self {
        self.add_field(name, field_type, bits, precision);
        self
    }

    pub fn add_field(&mut self, name: &str, field_type: FieldType, bits: u8, precision: u8) {
        assert!(self.fields.len() < MAX_FIELDS, "schema {} has too many fields", self.id);
        assert!(name.len() <= MAX_FIELD_NAME, "field name {name:?} is too long");
        assert!(precision <= MAX_PRECISION, "field {name:?}: precision {precision} out of range");

        let bits = match field_type {
            FieldType::Bool => 1,
            FieldType::String => 8,
            FieldType::Float | FieldType::Vector2 | FieldType::Vector3 | FieldType::Quaternion
                if precision == 0 =>
            {
                32
            }
            _ => bits,
        };
        assert!((1..=32).contains(&bits), "field {name:?}: {bits} bits out of range");
        assert!(
            field_type.is_float() || precision == 0,
            "field {name:?}: precision only applies to float fields"
        );

        let field = FieldInfo {
            name: name.to_string(),
            field_type,
            bits,
            precision,
            offset: self.word_count,
        };
        self.word_count += field.word_count();
        self.fields.push(field);
    }

    pub fn fields(&self) -> &[FieldInfo] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldInfo> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Record size in words.
    pub fn word_count(&self) -> usize {
        self.word_count
    }
}

pub fn write_schema(writer: &mut BitWriter, schema: &NetworkSchema) {
    writer.write_bits(schema.fields.len() as u32, 8);
    for field in &schema.fields {
        writer.write_bits(field.field_type as u32, 4);
        writer.write_bits(field.bits as u32 - 1, 5);
        writer.write_bits(field.precision as u32, 2);
        writer.write_bits(field.name.len() as u32, 8);
        writer.write_bytes(field.name.as_bytes());
    }
}

pub fn read_schema(reader: &mut BitReader<'_>, id: u16) -> Result<NetworkSchema, ProtocolError> {
    let count = reader.read_bits(8)? as usize;
    let mut schema = NetworkSchema::new(id);

    for _ in 0..count {
        let raw_type = reader.read_bits(4)? as u8;
        let field_type = FieldType::from_u8(raw_type)
            .ok_or_else(|| ProtocolError::InvalidSchema(format!("unknown field type {raw_type}")))?;
        let bits = reader.read_bits(5)? as u8 + 1;
        let precision = reader.read_bits(2)? as u8;
        if precision > MAX_PRECISION || (precision > 0 && !field_type.is_float()) {
            return Err(ProtocolError::InvalidSchema(format!(
                "precision {precision} on {field_type:?} field"
            )));
        }

        let mut name = vec![0u8; reader.read_bits(8)? as usize];
        reader.read_bytes(&mut name)?;
        let name = String::from_utf8(name)
            .map_err(|_| ProtocolError::InvalidSchema("field name is not utf-8".into()))?;

        schema.add_field(&name, field_type, bits, precision);
    }

    Ok(schema)
}
