/*
 * Copyright 2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! Tuple response targets: one [`FromResp3`] element per expected reply.

use crate::error::Error;
use crate::protocol::node::Node;

use super::{FromResp3, NodeAdapter, Response, ResponseSink};

macro_rules! impl_tuple_response {
    ($sink:ident, $len:expr => $(($T:ident, $field:ident, $idx:tt)),+) => {
        pub struct $sink<$($T: FromResp3),+> {
            $( $field: $T::Adapter, )+
            index: usize,
        }

        impl<$($T: FromResp3),+> ResponseSink for $sink<$($T),+> {
            type Output = ($($T,)+);

            fn on_node(&mut self, node: &Node<'_>) -> Result<(), Error> {
                match self.index {
                    $(
                        $idx => {
                            if self.$field.is_complete() {
                                Ok(())
                            } else {
                                self.$field.on_node(node)
                            }
                        }
                    )+
                    _ => Ok(()),
                }
            }

            fn end_reply(&mut self) {
                self.index += 1;
            }

            fn finish(&mut self) -> Result<Self::Output, Error> {
                Ok(($( self.$field.finish()?, )+))
            }
        }

        impl<$($T: FromResp3),+> Response for ($($T,)+) {
            type Sink = $sink<$($T),+>;
            const REPLIES: Option<usize> = Some($len);

            fn sink() -> Self::Sink {
                $sink {
                    $( $field: $T::adapter(), )+
                    index: 0,
                }
            }
        }
    };
}

impl_tuple_response!(TupleSink1, 1 => (A, a0, 0));
impl_tuple_response!(TupleSink2, 2 => (A, a0, 0), (B, a1, 1));
impl_tuple_response!(TupleSink3, 3 => (A, a0, 0), (B, a1, 1), (C, a2, 2));
impl_tuple_response!(TupleSink4, 4 => (A, a0, 0), (B, a1, 1), (C, a2, 2), (D, a3, 3));
impl_tuple_response!(TupleSink5, 5 => (A, a0, 0), (B, a1, 1), (C, a2, 2), (D, a3, 3), (E, a4, 4));
impl_tuple_response!(TupleSink6, 6 => (A, a0, 0), (B, a1, 1), (C, a2, 2), (D, a3, 3), (E, a4, 4), (F, a5, 5));
impl_tuple_response!(TupleSink7, 7 => (A, a0, 0), (B, a1, 1), (C, a2, 2), (D, a3, 3), (E, a4, 4), (F, a5, 5), (G, a6, 6));
impl_tuple_response!(TupleSink8, 8 => (A, a0, 0), (B, a1, 1), (C, a2, 2), (D, a3, 3), (E, a4, 4), (F, a5, 5), (G, a6, 6), (H, a7, 7));
