mod cancel;
mod dap_attach;
mod dap_disconnect_terminate;
mod dap_launch;
mod event_ordering;
mod json_error_sanitization;
mod outgoing_backpressure;
mod set_breakpoints;
mod stack_and_variables;
