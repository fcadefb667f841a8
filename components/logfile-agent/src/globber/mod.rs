pub mod globber;
