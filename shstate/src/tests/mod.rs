mod engine_pair;
