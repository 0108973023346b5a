pub mod switch_keithley_s46;
