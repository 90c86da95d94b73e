use std::mem;

/// Append-only buffer used to build canonical binary encodings
/// (query shapes and hashed index keys).
///
/// All multi-byte integers are written big-endian so that the encoding is
/// platform independent and two equal values always produce identical bytes.
pub struct ByteWriter {
    buffer: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> ByteWriter {
        ByteWriter { buffer: Vec::new() }
    }

    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.buffer.push(value);
        self
    }

    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.buffer.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn write_u64(&mut self, value: u64) -> &mut Self {
        self.buffer.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn write_i64(&mut self, value: i64) -> &mut Self {
        self.buffer.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn write_f64(&mut self, value: f64) -> &mut Self {
        // All NaN payloads collapse to a single representation.
        let bits = if value.is_nan() { f64::NAN.to_bits() } else { value.to_bits() };
        self.write_u64(bits)
    }

    pub fn write_bool(&mut self, value: bool) -> &mut Self {
        self.write_u8(if value { 1 } else { 0 })
    }

    pub fn write_str(&mut self, value: &str) -> &mut Self {
        self.write_length_prefixed_slice(value.as_bytes())
    }

    pub fn write_length_prefixed_slice(&mut self, value: &[u8]) -> &mut Self {
        self.write_u32(value.len() as u32);
        self.buffer.extend_from_slice(value);
        self
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    pub fn take_buffer(&mut self) -> Vec<u8> {
        mem::take(&mut self.buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_big_endian_layout() {
        let mut writer = ByteWriter::new();
        writer.write_u8(7).write_u32(0x01020304).write_i64(-1);
        assert_eq!(
            writer.take_buffer(),
            vec![7, 1, 2, 3, 4, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn test_length_prefixed_strings_are_unambiguous() {
        let mut ab_c = ByteWriter::new();
        ab_c.write_str("ab").write_str("c");
        let mut a_bc = ByteWriter::new();
        a_bc.write_str("a").write_str("bc");
        assert_ne!(ab_c.take_buffer(), a_bc.take_buffer());
    }

    #[test]
    fn test_nan_is_canonical() {
        let mut a = ByteWriter::new();
        a.write_f64(f64::NAN);
        let mut b = ByteWriter::new();
        b.write_f64(-f64::NAN);
        assert_eq!(a.take_buffer(), b.take_buffer());
    }
}
