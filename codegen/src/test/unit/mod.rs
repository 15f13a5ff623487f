pub mod driver;
pub mod extract;
pub mod openacc;
pub mod openmp;
