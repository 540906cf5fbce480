pub mod conv_bn;
pub mod inverted_residual;
