pub mod byte_writer;
