mod constant;
mod param_gen;
mod random;

pub use constant::ConstParamGen;
pub use param_gen::ParamGen;
pub use random::{RandParamGen, TruncatedNormal};
