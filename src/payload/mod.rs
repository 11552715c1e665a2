//! The payload module holds the small part of application data handling the
//! master needs itself: the variable data header (which carries the
//! secondary address) and a record splitter for the `request` command.

pub mod record;

pub use record::{
    id_to_manufacturer, parse_variable_data, parse_variable_header, split_records, RawRecord, VariableDataHeader,
};
