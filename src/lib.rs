pub mod mini_lb;
