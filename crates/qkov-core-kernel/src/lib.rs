pub mod cpu_attention;
pub mod cpu_eigen;
pub mod cpu_inspect;
pub mod cpu_matmul;
pub mod cpu_norm;
pub mod cpu_softmax;
pub mod cpu_topk;
