// Receive buffers are made of 4 byte aligned items so that tensor payloads, which start right
// after the 4 byte kind header, stay aligned for `f32`, `i32` and `u32` reads.
pub trait Align4: bytemuck::Pod {}

impl Align4 for u32 {}
impl Align4 for i32 {}
impl Align4 for u64 {}
impl Align4 for i64 {}
impl Align4 for f32 {}
impl Align4 for f64 {}
