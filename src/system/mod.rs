pub mod reset;
