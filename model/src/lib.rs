pub mod qrecords;
pub mod records;
pub mod requests;

pub use qrecords::{QRecord, QRecordBatch, QRecordSchema, QRecordStream};
pub use records::{Record, RecordItems, RecordType};
pub use requests::*;
