mod acceptor;

pub(crate) use acceptor::run_acceptor;
