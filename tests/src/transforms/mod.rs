mod call_indirection;
mod pipeline;
