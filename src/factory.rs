//! Connection controller factory
//!
//! Single entry point wiring transport, pairing store and post-logon
//! dispatch into one [`NetBidibController`]. The controller is created on
//! first use and re-initialized on every later request.

use std::sync::{Arc, Mutex};

use crate::config::NetBidibConfig;
use crate::controller::NetBidibController;
use crate::error::Result;
use crate::receiver::MessageDispatcher;
use crate::store::PairingStore;
use crate::transport::{TcpTransport, Transport};

/// Builds and reuses the netBiDiB controller for a transport
pub struct ConnectionControllerFactory<T: Transport> {
    transport: Arc<T>,
    store: Arc<Mutex<PairingStore>>,
    dispatcher: Arc<MessageDispatcher>,
    controller: Mutex<Option<Arc<NetBidibController<T>>>>,
}

impl ConnectionControllerFactory<TcpTransport> {
    /// Factory for netBiDiB over TCP
    pub fn tcp() -> Self {
        Self::new(Arc::new(TcpTransport::new()))
    }
}

impl<T: Transport + 'static> ConnectionControllerFactory<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            store: Arc::new(Mutex::new(PairingStore::new())),
            dispatcher: Arc::new(MessageDispatcher::new()),
            controller: Mutex::new(None),
        }
    }

    /// Shared pairing store
    pub fn store(&self) -> &Arc<Mutex<PairingStore>> {
        &self.store
    }

    /// Dispatcher receiving post-logon traffic; register receivers here
    pub fn dispatcher(&self) -> &Arc<MessageDispatcher> {
        &self.dispatcher
    }

    /// Initialize the pairing store and the controller from `config`
    pub fn get_controller(
        &self,
        config: Option<&NetBidibConfig>,
    ) -> Result<Arc<NetBidibController<T>>> {
        let controller = Arc::clone(
            self.controller
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .get_or_insert_with(|| self.create_controller()),
        );

        self.store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .initialize(config)?;
        controller.initialize(config)?;
        Ok(controller)
    }

    fn create_controller(&self) -> Arc<NetBidibController<T>> {
        let controller = Arc::new(NetBidibController::new(
            Arc::clone(&self.transport),
            Arc::clone(&self.store),
        ));

        let weak = Arc::downgrade(&controller);
        self.transport
            .set_receive_handler(Arc::new(move |data: &[u8]| {
                if let Some(controller) = weak.upgrade() {
                    controller.process_message(data, data.len());
                }
            }));

        let weak = Arc::downgrade(&controller);
        self.transport.set_close_handler(Arc::new(move || {
            if let Some(controller) = weak.upgrade() {
                log::info!("{} lost", controller.connection_name());
                controller.close();
            }
        }));

        let dispatcher = Arc::clone(&self.dispatcher);
        controller.set_received_data_handler(Arc::new(move |data: &[u8]| {
            dispatcher.dispatch(data)
        }));

        controller
    }
}
