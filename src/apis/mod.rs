pub mod bea;
pub mod bulk_csv;
