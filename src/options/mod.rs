pub mod options;
pub mod storage_quantity;
