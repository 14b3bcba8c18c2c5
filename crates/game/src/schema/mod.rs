mod codec;
mod field;
mod record;
mod registry;

pub use codec::{
    DECODER_PRECISION_SCALES, ENCODER_PRECISION_SCALES, copy_fields_from_buffer,
    copy_fields_to_buffer, dequantize, predict_record, quantize, skip_fields,
};
pub use field::{
    FieldInfo, FieldType, MAX_FIELDS, MAX_PRECISION, MAX_STRING_BYTES, NetworkSchema,
    STRING_WORDS, read_schema, write_schema,
};
pub use record::{FieldReader, FieldWriter};
pub use registry::{
    AckedSchemas, MAX_COMMAND_TYPES, MAX_ENTITY_TYPES, MAX_EVENT_TYPES, MAX_MAP_TYPES,
    SchemaCategory, SchemaError, SchemaRegistry,
};
