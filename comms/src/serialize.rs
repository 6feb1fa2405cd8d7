use std::io;

pub trait Serialize<'a> {
    /// Writes the owned part of `self` into `buf`.
    ///
    /// # Arguments
    /// * `buf` - The buffer where the framed header and owned data are written.
    ///
    /// # Returns
    /// An optional borrowed tail that is sent right after `buf` without copying it, or an
    /// `io::Error` if the value could not be encoded.
    fn serialize(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>>;
}
