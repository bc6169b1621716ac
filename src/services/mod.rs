pub mod archive;
pub mod cases;
pub mod excel;
pub mod locks;
pub mod metadata;
pub mod paths;
pub mod rules;
